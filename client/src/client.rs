//! The thin client: connects, authenticates, keeps the world mirror current and streams one
//! input packet per tick. Rendering and input devices live behind [`Frontend`]; the core loop
//! works the same whether a real window drives it or nothing does.

use crate::chunk_entities::ClientChunkEntities;
use crate::prediction::MovementInputs;
use crate::session::{ClientSessionHandler, SessionStage};
use crate::Arguments;
use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::constants::{PLAYER_MAX_NICKNAME_LENGTH, TICK_DURATION};
use lodestone_shared::network::{IncomingEvent, NetworkReactor, NetworkSession, INVALID_PEER_ID};
use lodestone_shared::protocol::{AuthRequest, Packet, UpdatePlayerInputs};
use lodestone_shared::version::GAME_VERSION;
use log::{info, warn};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_PORT: u16 = 29560;

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("no server address given, nothing to connect to")]
	NoServerAddress,

	#[error("cannot resolve server address {0:?}")]
	UnresolvableAddress(String),

	#[error("connection to {0} failed")]
	ConnectionFailed(SocketAddr),

	#[error(transparent)]
	Reactor(#[from] lodestone_shared::network::ReactorError),
}

/// What the surrounding application samples each tick and hands to the core loop. A windowed
/// frontend fills this from the keyboard and mouse; headless runs leave it empty.
pub trait Frontend {
	fn movement(&mut self) -> MovementInputs;
	/// Mouse motion since the last call, in degrees of camera rotation.
	fn rotation_delta(&mut self) -> (f32, f32);
	fn keep_running(&self) -> bool;
}

/// Frontend used when no window drives the client.
pub struct IdleFrontend;

impl Frontend for IdleFrontend {
	fn movement(&mut self) -> MovementInputs {
		MovementInputs::default()
	}

	fn rotation_delta(&mut self) -> (f32, f32) {
		(0.0, 0.0)
	}

	fn keep_running(&self) -> bool {
		true
	}
}

pub struct Client {
	reactor: NetworkReactor,
	session: NetworkSession,
	handler: ClientSessionHandler,
	chunk_entities: ClientChunkEntities,
	nickname: String,
}

impl Client {
	pub fn connect(arguments: &Arguments) -> Result<Self, ClientError> {
		let address = resolve_address(arguments.server_address.as_deref().ok_or(ClientError::NoServerAddress)?)?;

		let reactor = NetworkReactor::new(None, 0, 1)?;

		let peer_id = reactor.connect_to(address);
		if peer_id == INVALID_PEER_ID {
			return Err(ClientError::ConnectionFailed(address));
		}

		info!("connected to {address}");

		let session = NetworkSession::new(peer_id, address, reactor.outgoing_sender());
		session.set_protocol_version(GAME_VERSION);

		let mut nickname = arguments.nickname.clone().unwrap_or_else(|| String::from("Player"));
		if nickname.len() > PLAYER_MAX_NICKNAME_LENGTH {
			let mut cut = PLAYER_MAX_NICKNAME_LENGTH;
			while !nickname.is_char_boundary(cut) {
				cut -= 1;
			}
			nickname.truncate(cut);
			warn!("nickname is too long, using {nickname:?}");
		}

		session.send_packet(&Packet::AuthRequest(AuthRequest {
			game_version: GAME_VERSION,
			nickname: nickname.clone(),
			connection_token: None,
		}));

		let block_library = std::sync::Arc::new(BlockLibrary::with_default_blocks());

		Ok(Self {
			reactor,
			session,
			handler: ClientSessionHandler::new(block_library.clone()),
			chunk_entities: ClientChunkEntities::new(block_library),
			nickname,
		})
	}

	pub fn run(mut self, frontend: &mut dyn Frontend) -> Result<(), ClientError> {
		info!("running as {}", self.nickname);

		let mut next_tick = Instant::now();

		loop {
			if !frontend.keep_running() {
				return Ok(());
			}

			while let Some(event) = self.reactor.try_receive() {
				match event {
					IncomingEvent::Connect { .. } => {}
					IncomingEvent::Disconnect { timeout, .. } => {
						if timeout {
							warn!("connection timed out");
						} else {
							info!("disconnected");
						}
						return Ok(());
					}
					IncomingEvent::Packet { payload, .. } => {
						match Packet::decode(&payload, self.session.protocol_version()) {
							Ok(packet) => self.handler.handle_packet(&self.session, packet),
							Err(protocol_error) => {
								warn!("undecodable packet from server: {protocol_error}");
								return Ok(());
							}
						}
					}
					IncomingEvent::PeerInfo { info, callback, .. } => callback(info),
				}
			}

			if let SessionStage::Failed(auth_error) = self.handler.stage {
				warn!("giving up after failed authentication: {auth_error:?}");
				return Ok(());
			}

			let now = Instant::now();
			if now >= next_tick {
				self.tick(frontend);
				next_tick += TICK_DURATION;

				// Fell far behind (breakpoint, suspend): resynchronize instead of spinning
				if now > next_tick + TICK_DURATION * 4 {
					next_tick = now + TICK_DURATION;
				}
			}

			thread::sleep(Duration::from_millis(1));
		}
	}

	fn tick(&mut self, frontend: &mut dyn Frontend) {
		if self.handler.stage != SessionStage::Playing {
			return;
		}

		self.chunk_entities.update(&self.handler.world);

		let (pitch, yaw) = frontend.rotation_delta();
		self.handler.predictor.accumulate_rotation(pitch, yaw);

		let inputs = self.handler.predictor.sample_inputs(frontend.movement());
		self.session
			.send_packet(&Packet::UpdatePlayerInputs(UpdatePlayerInputs { inputs }));
	}
}

fn resolve_address(input: &str) -> Result<SocketAddr, ClientError> {
	if let Ok(address) = input.parse() {
		return Ok(address);
	}

	let with_port;
	let lookup = if input.contains(':') {
		input
	} else {
		with_port = format!("{input}:{DEFAULT_PORT}");
		&with_port
	};

	lookup
		.to_socket_addrs()
		.ok()
		.and_then(|mut addresses| addresses.next())
		.ok_or_else(|| ClientError::UnresolvableAddress(input.to_owned()))
}
