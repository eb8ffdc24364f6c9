//! Worker-thread owner of the reliable datagram host.
//!
//! The main thread never touches sockets; it talks to the reactor through two lock-free MPMC
//! queues, commands out and events in. The host itself is TCP with length-prefixed channelized
//! frames, which gives the ordered-per-channel, reliable delivery the rest of the engine assumes.
//! `Unreliable` is a send-time hint: such packets may be dropped locally when a peer's send queue
//! backs up, but are never reordered relative to the same channel.
//!
//! Frame layout: `u8 channel | u32 length (LE) | payload`. Channel `0xFF` with length 0 is the
//! keep-alive. A peer silent for 20 seconds is reported as a timeout disconnect.

use crate::constants::{NETWORK_CHANNEL_COUNT, PACKET_LENGTH_LIMIT};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, sleep, timeout, Instant};

pub use crate::protocol::PacketReliability;

pub type PeerId = usize;
pub const INVALID_PEER_ID: PeerId = usize::MAX;

const KEEP_ALIVE_CHANNEL: u8 = 0xFF;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(20);
const SERVICE_TIMEOUT: Duration = Duration::from_millis(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);
const UNRELIABLE_QUEUE_LIMIT: usize = 128;

#[derive(Debug, Error)]
pub enum ReactorError {
	#[error("failed to start reactor: {0}")]
	Bind(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectionType {
	/// Drop the peer immediately; nothing queued is flushed.
	Kick,
	/// Flush queued packets, then disconnect.
	Later,
	/// Disconnect as soon as possible without dropping queued packets.
	Normal,
}

pub type AckCallback = Box<dyn FnOnce() + Send>;
pub type PeerInfoCallback = Box<dyn FnOnce(PeerInfo) + Send>;

#[derive(Clone, Copy, Debug, Default)]
pub struct PeerInfo {
	pub time_since_last_receive: Duration,
	pub total_bytes_sent: u64,
	pub total_bytes_received: u64,
	pub total_packets_sent: u64,
	pub total_packets_received: u64,
}

pub struct SendCommand {
	pub channel: u8,
	pub reliability: PacketReliability,
	pub payload: Vec<u8>,
	pub on_acknowledged: Option<AckCallback>,
}

pub enum OutgoingCommand {
	Disconnect(DisconnectionType),
	Send(SendCommand),
	QueryPeerInfo(PeerInfoCallback),
}

pub struct OutgoingEvent {
	pub peer_id: PeerId,
	pub command: OutgoingCommand,
}

pub enum IncomingEvent {
	Connect {
		peer_id: PeerId,
		remote_address: SocketAddr,
		outgoing_connection: bool,
	},
	Disconnect {
		peer_id: PeerId,
		timeout: bool,
	},
	Packet {
		peer_id: PeerId,
		channel: u8,
		payload: Vec<u8>,
	},
	PeerInfo {
		peer_id: PeerId,
		info: PeerInfo,
		callback: PeerInfoCallback,
	},
}

struct ConnectionRequest {
	address: SocketAddr,
	reply: Sender<PeerId>,
}

pub struct NetworkReactor {
	id_offset: PeerId,
	local_address: Option<SocketAddr>,

	outgoing: Sender<OutgoingEvent>,
	incoming: Receiver<IncomingEvent>,
	connection_requests: Sender<ConnectionRequest>,

	running: Arc<AtomicBool>,
	worker: Option<JoinHandle<()>>,
}

impl NetworkReactor {
	/// Starts the reactor. `listen` is the server listen address; clients pass `None` and use
	/// [`NetworkReactor::connect_to`]. `id_offset` namespaces peer ids when several reactors
	/// coexist (one per IP family in use).
	pub fn new(listen: Option<SocketAddr>, id_offset: PeerId, max_peers: usize) -> Result<Self, ReactorError> {
		let listener = match listen {
			Some(address) => {
				let listener = std::net::TcpListener::bind(address)?;
				listener.set_nonblocking(true)?;
				Some(listener)
			}
			None => None,
		};
		let local_address = listener.as_ref().and_then(|listener| listener.local_addr().ok());

		let (outgoing, outgoing_rx) = unbounded();
		let (incoming_tx, incoming) = unbounded();
		let (connection_requests, connection_rx) = unbounded();

		let running = Arc::new(AtomicBool::new(true));
		let worker_running = running.clone();

		let worker = std::thread::Builder::new()
			.name("network-reactor".into())
			.spawn(move || {
				worker_thread(WorkerState {
					listener,
					id_offset,
					max_peers,
					running: worker_running,
					outgoing: outgoing_rx,
					incoming: incoming_tx,
					connection_requests: connection_rx,
				});
			})
			.map_err(ReactorError::Bind)?;

		Ok(Self {
			id_offset,
			local_address,
			outgoing,
			incoming,
			connection_requests,
			running,
			worker: Some(worker),
		})
	}

	#[must_use]
	pub const fn id_offset(&self) -> PeerId {
		self.id_offset
	}

	/// The actual listen address, useful when binding to port 0.
	#[must_use]
	pub const fn local_address(&self) -> Option<SocketAddr> {
		self.local_address
	}

	/// Dials a remote host, blocking the caller until the reactor reports the outcome. Returns
	/// [`INVALID_PEER_ID`] on failure.
	#[must_use]
	pub fn connect_to(&self, address: SocketAddr) -> PeerId {
		let (reply, response) = bounded(1);

		if self.connection_requests.send(ConnectionRequest { address, reply }).is_err() {
			return INVALID_PEER_ID;
		}

		response.recv().unwrap_or(INVALID_PEER_ID)
	}

	pub fn send(
		&self,
		peer_id: PeerId,
		channel: u8,
		reliability: PacketReliability,
		payload: Vec<u8>,
		on_acknowledged: Option<AckCallback>,
	) {
		let _ = self.outgoing.send(OutgoingEvent {
			peer_id,
			command: OutgoingCommand::Send(SendCommand { channel, reliability, payload, on_acknowledged }),
		});
	}

	pub fn disconnect_peer(&self, peer_id: PeerId, disconnection: DisconnectionType) {
		let _ = self.outgoing.send(OutgoingEvent {
			peer_id,
			command: OutgoingCommand::Disconnect(disconnection),
		});
	}

	pub fn query_info(&self, peer_id: PeerId, callback: PeerInfoCallback) {
		let _ = self.outgoing.send(OutgoingEvent {
			peer_id,
			command: OutgoingCommand::QueryPeerInfo(callback),
		});
	}

	/// Non-blocking poll of the incoming event queue. The main thread is the sole consumer.
	#[must_use]
	pub fn try_receive(&self) -> Option<IncomingEvent> {
		self.incoming.try_recv().ok()
	}

	/// Command queue handle for [`crate::network::NetworkSession`].
	#[must_use]
	pub fn outgoing_sender(&self) -> Sender<OutgoingEvent> {
		self.outgoing.clone()
	}
}

impl Drop for NetworkReactor {
	fn drop(&mut self) {
		self.running.store(false, Relaxed);

		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
	}
}

struct PeerCounters {
	bytes_sent: AtomicU64,
	bytes_received: AtomicU64,
	packets_sent: AtomicU64,
	packets_received: AtomicU64,
	last_receive_millis: AtomicU64,
}

enum PeerCommand {
	Frame {
		channel: u8,
		payload: Vec<u8>,
		on_acknowledged: Option<AckCallback>,
	},
	/// Flush everything already queued, then shut the stream down.
	Close,
}

struct Peer {
	commands: UnboundedSender<PeerCommand>,
	queued: Arc<AtomicUsize>,
	counters: Arc<PeerCounters>,
	epoch: Instant,
	reader: tokio::task::JoinHandle<()>,
	writer: tokio::task::JoinHandle<()>,
}

struct PeerClosed {
	slot: usize,
	timeout: bool,
}

struct WorkerState {
	listener: Option<std::net::TcpListener>,
	id_offset: PeerId,
	max_peers: usize,
	running: Arc<AtomicBool>,
	outgoing: Receiver<OutgoingEvent>,
	incoming: Sender<IncomingEvent>,
	connection_requests: Receiver<ConnectionRequest>,
}

fn worker_thread(state: WorkerState) {
	let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
		Ok(runtime) => runtime,
		Err(error) => {
			warn!("failed to build reactor runtime: {error}");
			return;
		}
	};

	runtime.block_on(worker_loop(state));
}

async fn worker_loop(state: WorkerState) {
	let WorkerState { listener, id_offset, max_peers, running, outgoing, incoming, connection_requests } = state;

	let listener = listener.and_then(|listener| match TcpListener::from_std(listener) {
		Ok(listener) => Some(listener),
		Err(error) => {
			warn!("failed to register listener: {error}");
			None
		}
	});

	let mut peers: Vec<Option<Peer>> = (0..max_peers).map(|_| None).collect();
	let (peer_closed_tx, mut peer_closed) = unbounded_channel::<PeerClosed>();

	while running.load(Relaxed) {
		// 1. Service the host for a few milliseconds, accepting connections and reaping closed
		//    peers; packets flow straight from the reader tasks to the incoming queue.
		tokio::select! {
			accepted = accept_on(&listener) => {
				if let Some((stream, remote_address)) = accepted {
					match free_slot(&peers) {
						Some(slot) => {
							peers[slot] = Some(spawn_peer(stream, slot, id_offset, &incoming, &peer_closed_tx));
							let _ = incoming.send(IncomingEvent::Connect {
								peer_id: id_offset + slot,
								remote_address,
								outgoing_connection: false,
							});
						}
						None => debug!("rejecting connection from {remote_address}, no free peer slot"),
					}
				}
			}
			closed = peer_closed.recv() => {
				if let Some(closed) = closed {
					reap_peer(&mut peers, closed, id_offset, &incoming);
				}
			}
			_ = sleep(SERVICE_TIMEOUT) => {}
		}

		// 2. Drain the outgoing command queue.
		while let Ok(event) = outgoing.try_recv() {
			handle_outgoing(event, &mut peers, id_offset, &incoming);
		}

		// 3. Handle connection requests last so disconnections are processed first.
		while let Ok(request) = connection_requests.try_recv() {
			let peer_id = match free_slot(&peers) {
				Some(slot) => match timeout(Duration::from_secs(5), TcpStream::connect(request.address)).await {
					Ok(Ok(stream)) => {
						peers[slot] = Some(spawn_peer(stream, slot, id_offset, &incoming, &peer_closed_tx));
						let _ = incoming.send(IncomingEvent::Connect {
							peer_id: id_offset + slot,
							remote_address: request.address,
							outgoing_connection: true,
						});
						id_offset + slot
					}
					_ => INVALID_PEER_ID,
				},
				None => INVALID_PEER_ID,
			};

			let _ = request.reply.send(peer_id);
		}
	}

	// Shutdown: flush remaining commands, close every peer, then drain for up to a second so the
	// close frames actually reach the wire.
	while let Ok(event) = outgoing.try_recv() {
		handle_outgoing(event, &mut peers, id_offset, &incoming);
	}

	for peer in peers.iter().flatten() {
		let _ = peer.commands.send(PeerCommand::Close);
	}

	let deadline = Instant::now() + SHUTDOWN_DRAIN;
	while peers.iter().any(Option::is_some) {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			break;
		}

		match timeout(remaining, peer_closed.recv()).await {
			Ok(Some(closed)) => reap_peer(&mut peers, closed, id_offset, &incoming),
			_ => break,
		}
	}
}

async fn accept_on(listener: &Option<TcpListener>) -> Option<(TcpStream, SocketAddr)> {
	match listener {
		Some(listener) => listener.accept().await.ok(),
		// Pending forever; the select! falls through on its service timeout
		None => std::future::pending().await,
	}
}

fn free_slot(peers: &[Option<Peer>]) -> Option<usize> {
	peers.iter().position(Option::is_none)
}

fn reap_peer(peers: &mut [Option<Peer>], closed: PeerClosed, id_offset: PeerId, incoming: &Sender<IncomingEvent>) {
	// Both halves report closure; only the first one counts
	if let Some(peer) = peers[closed.slot].take() {
		peer.reader.abort();
		peer.writer.abort();

		let _ = incoming.send(IncomingEvent::Disconnect {
			peer_id: id_offset + closed.slot,
			timeout: closed.timeout,
		});
	}
}

fn handle_outgoing(event: OutgoingEvent, peers: &mut [Option<Peer>], id_offset: PeerId, incoming: &Sender<IncomingEvent>) {
	let slot = match event.peer_id.checked_sub(id_offset) {
		Some(slot) if slot < peers.len() => slot,
		_ => return,
	};

	match event.command {
		OutgoingCommand::Disconnect(disconnection) => {
			let Some(peer) = &peers[slot] else { return };

			match disconnection {
				DisconnectionType::Kick => {
					// Dropping the peer kills both halves immediately; the host never reports a
					// disconnect for a kick, so synthesize one
					if let Some(peer) = peers[slot].take() {
						peer.reader.abort();
						peer.writer.abort();
					}

					let _ = incoming.send(IncomingEvent::Disconnect { peer_id: event.peer_id, timeout: false });
				}
				DisconnectionType::Later | DisconnectionType::Normal => {
					let _ = peer.commands.send(PeerCommand::Close);
				}
			}
		}
		OutgoingCommand::Send(send) => {
			let Some(peer) = &peers[slot] else { return };

			// Unreliable traffic is the first thing to go when a peer cannot keep up
			if send.reliability == PacketReliability::Unreliable && peer.queued.load(Relaxed) > UNRELIABLE_QUEUE_LIMIT {
				return;
			}

			peer.queued.fetch_add(1, Relaxed);
			let _ = peer.commands.send(PeerCommand::Frame {
				channel: send.channel,
				payload: send.payload,
				on_acknowledged: send.on_acknowledged,
			});
		}
		OutgoingCommand::QueryPeerInfo(callback) => {
			let Some(peer) = &peers[slot] else { return };

			let last_receive = peer.counters.last_receive_millis.load(Relaxed);
			let now = peer.epoch.elapsed().as_millis() as u64;

			let info = PeerInfo {
				time_since_last_receive: Duration::from_millis(now.saturating_sub(last_receive)),
				total_bytes_sent: peer.counters.bytes_sent.load(Relaxed),
				total_bytes_received: peer.counters.bytes_received.load(Relaxed),
				total_packets_sent: peer.counters.packets_sent.load(Relaxed),
				total_packets_received: peer.counters.packets_received.load(Relaxed),
			};

			let _ = incoming.send(IncomingEvent::PeerInfo { peer_id: event.peer_id, info, callback });
		}
	}
}

fn spawn_peer(
	stream: TcpStream,
	slot: usize,
	id_offset: PeerId,
	incoming: &Sender<IncomingEvent>,
	peer_closed: &UnboundedSender<PeerClosed>,
) -> Peer {
	let _ = stream.set_nodelay(true);
	let (read_half, write_half) = stream.into_split();

	let counters = Arc::new(PeerCounters {
		bytes_sent: AtomicU64::new(0),
		bytes_received: AtomicU64::new(0),
		packets_sent: AtomicU64::new(0),
		packets_received: AtomicU64::new(0),
		last_receive_millis: AtomicU64::new(0),
	});
	let queued = Arc::new(AtomicUsize::new(0));
	let epoch = Instant::now();

	let (commands, command_rx) = unbounded_channel();

	let reader = tokio::spawn(read_loop(
		read_half,
		slot,
		id_offset,
		epoch,
		counters.clone(),
		incoming.clone(),
		peer_closed.clone(),
	));
	let writer = tokio::spawn(write_loop(write_half, slot, command_rx, queued.clone(), counters.clone(), peer_closed.clone()));

	Peer {
		commands,
		queued,
		counters,
		epoch,
		reader,
		writer,
	}
}

async fn read_loop(
	mut stream: OwnedReadHalf,
	slot: usize,
	id_offset: PeerId,
	epoch: Instant,
	counters: Arc<PeerCounters>,
	incoming: Sender<IncomingEvent>,
	peer_closed: UnboundedSender<PeerClosed>,
) {
	loop {
		match timeout(RECEIVE_TIMEOUT, read_frame(&mut stream)).await {
			Err(_) => {
				let _ = peer_closed.send(PeerClosed { slot, timeout: true });
				return;
			}
			Ok(Err(_)) => {
				let _ = peer_closed.send(PeerClosed { slot, timeout: false });
				return;
			}
			Ok(Ok(frame)) => {
				counters.last_receive_millis.store(epoch.elapsed().as_millis() as u64, Relaxed);

				if let Some((channel, payload)) = frame {
					counters.packets_received.fetch_add(1, Relaxed);
					counters.bytes_received.fetch_add(payload.len() as u64, Relaxed);

					if incoming
						.send(IncomingEvent::Packet { peer_id: id_offset + slot, channel, payload })
						.is_err()
					{
						return;
					}
				}
			}
		}
	}
}

/// Reads one frame; `None` is a keep-alive.
async fn read_frame(stream: &mut OwnedReadHalf) -> std::io::Result<Option<(u8, Vec<u8>)>> {
	let channel = stream.read_u8().await?;
	let length = stream.read_u32_le().await? as usize;

	if channel == KEEP_ALIVE_CHANNEL && length == 0 {
		return Ok(None);
	}

	if channel >= NETWORK_CHANNEL_COUNT {
		return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "channel out of range"));
	}

	if length > PACKET_LENGTH_LIMIT {
		return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "packet oversized"));
	}

	let mut payload = vec![0; length];
	stream.read_exact(&mut payload).await?;

	Ok(Some((channel, payload)))
}

async fn write_loop(
	mut stream: OwnedWriteHalf,
	slot: usize,
	mut commands: UnboundedReceiver<PeerCommand>,
	queued: Arc<AtomicUsize>,
	counters: Arc<PeerCounters>,
	peer_closed: UnboundedSender<PeerClosed>,
) {
	let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);

	loop {
		tokio::select! {
			command = commands.recv() => match command {
				Some(PeerCommand::Frame { channel, payload, on_acknowledged }) => {
					queued.fetch_sub(1, Relaxed);

					let result: std::io::Result<()> = async {
						stream.write_u8(channel).await?;
						stream.write_u32_le(payload.len() as u32).await?;
						stream.write_all(&payload).await?;
						stream.flush().await
					}
					.await;

					match result {
						Ok(()) => {
							counters.packets_sent.fetch_add(1, Relaxed);
							counters.bytes_sent.fetch_add(payload.len() as u64, Relaxed);

							// The transport is reliable, so a flushed write is an acknowledged one
							if let Some(on_acknowledged) = on_acknowledged {
								on_acknowledged();
							}
						}
						Err(_) => {
							let _ = peer_closed.send(PeerClosed { slot, timeout: false });
							return;
						}
					}
				}
				Some(PeerCommand::Close) | None => {
					let _ = stream.shutdown().await;
					let _ = peer_closed.send(PeerClosed { slot, timeout: false });
					return;
				}
			},
			_ = keep_alive.tick() => {
				let result: std::io::Result<()> = async {
					stream.write_u8(KEEP_ALIVE_CHANNEL).await?;
					stream.write_u32_le(0).await?;
					stream.flush().await
				}
				.await;

				if result.is_err() {
					let _ = peer_closed.send(PeerClosed { slot, timeout: false });
					return;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::PacketReliability;
	use std::time::Instant as StdInstant;

	fn wait_for_event(reactor: &NetworkReactor, mut accept: impl FnMut(&IncomingEvent) -> bool) -> IncomingEvent {
		let deadline = StdInstant::now() + Duration::from_secs(5);
		loop {
			if let Some(event) = reactor.try_receive() {
				if accept(&event) {
					return event;
				}
			}

			assert!(StdInstant::now() < deadline, "timed out waiting for reactor event");
			std::thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn packets_flow_between_two_reactors() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
		let address = listener.local_addr().expect("probe address");
		drop(listener);

		let server = NetworkReactor::new(Some(address), 0, 4).expect("server reactor");
		let client = NetworkReactor::new(None, 1000, 4).expect("client reactor");

		let server_peer = client.connect_to(address);
		assert_ne!(server_peer, INVALID_PEER_ID);

		let connect = wait_for_event(&server, |event| matches!(event, IncomingEvent::Connect { .. }));
		let IncomingEvent::Connect { peer_id, outgoing_connection, .. } = connect else {
			unreachable!()
		};
		assert!(!outgoing_connection);

		client.send(server_peer, 1, PacketReliability::Reliable, vec![1, 2, 3], None);

		let packet = wait_for_event(&server, |event| matches!(event, IncomingEvent::Packet { .. }));
		let IncomingEvent::Packet { channel, payload, .. } = packet else {
			unreachable!()
		};
		assert_eq!(channel, 1);
		assert_eq!(payload, vec![1, 2, 3]);

		server.send(peer_id, 2, PacketReliability::Reliable, vec![9], None);
		let packet = wait_for_event(&client, |event| matches!(event, IncomingEvent::Packet { .. }));
		let IncomingEvent::Packet { channel, payload, .. } = packet else {
			unreachable!()
		};
		assert_eq!(channel, 2);
		assert_eq!(payload, vec![9]);
	}

	#[test]
	fn kick_synthesizes_a_local_disconnect() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
		let address = listener.local_addr().expect("probe address");
		drop(listener);

		let server = NetworkReactor::new(Some(address), 0, 4).expect("server reactor");
		let client = NetworkReactor::new(None, 1000, 4).expect("client reactor");

		assert_ne!(client.connect_to(address), INVALID_PEER_ID);
		let connect = wait_for_event(&server, |event| matches!(event, IncomingEvent::Connect { .. }));
		let IncomingEvent::Connect { peer_id, .. } = connect else { unreachable!() };

		server.disconnect_peer(peer_id, DisconnectionType::Kick);

		let disconnect = wait_for_event(&server, |event| matches!(event, IncomingEvent::Disconnect { .. }));
		let IncomingEvent::Disconnect { peer_id: disconnected, timeout } = disconnect else {
			unreachable!()
		};
		assert_eq!(disconnected, peer_id);
		assert!(!timeout);
	}
}
