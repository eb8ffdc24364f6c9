//! Per-connection session state shared by the server and the client.
//!
//! A session is the typed face of one reactor peer: it knows the negotiated protocol version and
//! turns packets into reactor send commands with the right channel and reliability. What happens
//! to received packets is up to the session handler installed by the owning side; handlers are
//! swapped atomically from the session's point of view (the replacement takes effect before the
//! next packet is dispatched).

use crate::network::reactor::{AckCallback, DisconnectionType, OutgoingCommand, OutgoingEvent, PeerId, SendCommand};
use crate::protocol::Packet;
use crossbeam_channel::Sender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

pub struct NetworkSession {
	peer_id: PeerId,
	remote_address: SocketAddr,
	protocol_version: AtomicU32,
	outgoing: Sender<OutgoingEvent>,
}

impl NetworkSession {
	#[must_use]
	pub fn new(peer_id: PeerId, remote_address: SocketAddr, outgoing: Sender<OutgoingEvent>) -> Self {
		Self {
			peer_id,
			remote_address,
			// Assume the oldest supported protocol until authentication has negotiated one
			protocol_version: AtomicU32::new(crate::version::PROTOCOL_REQUIRED_CLIENT_VERSION),
			outgoing,
		}
	}

	#[must_use]
	pub const fn peer_id(&self) -> PeerId {
		self.peer_id
	}

	#[must_use]
	pub const fn remote_address(&self) -> SocketAddr {
		self.remote_address
	}

	#[must_use]
	pub fn protocol_version(&self) -> u32 {
		self.protocol_version.load(Relaxed)
	}

	pub fn set_protocol_version(&self, version: u32) {
		self.protocol_version.store(version, Relaxed);
	}

	pub fn send_packet(&self, packet: &Packet) {
		self.send_packet_internal(packet, None);
	}

	/// Sends a packet and runs `on_acknowledged` once the peer is known to have received it.
	pub fn send_packet_acknowledged(&self, packet: &Packet, on_acknowledged: impl FnOnce() + Send + 'static) {
		self.send_packet_internal(packet, Some(Box::new(on_acknowledged)));
	}

	pub fn disconnect(&self, disconnection: DisconnectionType) {
		let _ = self.outgoing.send(OutgoingEvent {
			peer_id: self.peer_id,
			command: OutgoingCommand::Disconnect(disconnection),
		});
	}

	fn send_packet_internal(&self, packet: &Packet, on_acknowledged: Option<AckCallback>) {
		// A closed queue means the reactor is shutting down, nothing sensible left to do
		let _ = self.outgoing.send(OutgoingEvent {
			peer_id: self.peer_id,
			command: OutgoingCommand::Send(SendCommand {
				channel: packet.channel(),
				reliability: packet.reliability(),
				payload: packet.encode(self.protocol_version()),
				on_acknowledged,
			}),
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::{ChunkDestroy, Packet};
	use crate::version::GAME_VERSION;

	#[test]
	fn sent_packets_carry_channel_and_payload() {
		let (outgoing, commands) = crossbeam_channel::unbounded();
		let session = NetworkSession::new(7, "127.0.0.1:9".parse().expect("address"), outgoing);
		session.set_protocol_version(GAME_VERSION);

		let packet = Packet::ChunkDestroy(ChunkDestroy { tick_index: 3, chunk_id: 12 });
		session.send_packet(&packet);

		let event = commands.try_recv().expect("a command must be queued");
		assert_eq!(event.peer_id, 7);

		let OutgoingCommand::Send(send) = event.command else {
			panic!("expected a send command");
		};
		assert_eq!(send.channel, packet.channel());
		assert_eq!(Packet::decode(&send.payload, GAME_VERSION).expect("decode"), packet);
	}
}
