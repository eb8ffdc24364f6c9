//! Per-connection packet dispatch.
//!
//! Each session runs a two-state machine: the initial handler only accepts `AuthRequest` and
//! either rejects the peer or swaps itself for the player handler, which accepts the gameplay
//! packets. Protocol violations kick the peer; failed authentication answers first and
//! disconnects later so the response actually arrives.

use crate::entities::PlayerIndex;
use crate::instance::ServerInstance;
use lodestone_shared::blocks::EMPTY_BLOCK;
use lodestone_shared::constants::PLAYER_MAX_NICKNAME_LENGTH;
use lodestone_shared::network::{DisconnectionType, NetworkSession};
use lodestone_shared::protocol::{
	AuthError, AuthRequest, AuthResponse, EnvironmentCreate, EnvironmentTransform, MineBlock, Packet, PlaceBlock,
	PlayerNameUpdate, SendChatMessage, UpdateRootEnvironment, CONNECTION_TOKEN_LENGTH,
};
use lodestone_shared::version::{decode_version, GAME_VERSION, PROTOCOL_REQUIRED_CLIENT_VERSION};
use log::{info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use rapier3d::geometry::Cuboid;

pub struct Session {
	pub network: NetworkSession,
	pub handler: SessionHandler,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionHandler {
	Initial,
	Player(PlayerIndex),
}

impl ServerInstance {
	pub fn handle_packet(&mut self, peer_id: usize, payload: &[u8]) {
		let Some(session) = self.sessions.get(&peer_id) else { return };
		let handler = session.handler;

		let packet = match Packet::decode(payload, session.network.protocol_version()) {
			Ok(packet) => packet,
			Err(error) => {
				// A broken AuthRequest still deserves an answer; everything else is a kick
				if handler == SessionHandler::Initial && payload.first() == Some(&0) {
					warn!("[{}] failed to deserialize auth packet: {error}", session.network.remote_address());
					session
						.network
						.send_packet(&Packet::AuthResponse(AuthResponse { result: Err(AuthError::ProtocolError) }));
					session.network.disconnect(DisconnectionType::Later);
				} else {
					warn!("[{}] failed to deserialize packet: {error}", session.network.remote_address());
					session.network.disconnect(DisconnectionType::Kick);
				}
				return;
			}
		};

		match (handler, packet) {
			(SessionHandler::Initial, Packet::AuthRequest(request)) => self.handle_auth_request(peer_id, request),

			(SessionHandler::Player(player_index), Packet::MineBlock(mine)) => self.handle_mine_block(player_index, mine),
			(SessionHandler::Player(player_index), Packet::PlaceBlock(place)) => self.handle_place_block(player_index, place),
			(SessionHandler::Player(player_index), Packet::SendChatMessage(chat)) => self.handle_chat_message(player_index, chat),
			(SessionHandler::Player(player_index), Packet::UpdatePlayerInputs(inputs)) => {
				if let Some(player) = self.players.get_mut(player_index) {
					player.push_inputs(inputs.inputs);
				}
			}

			(_, packet) => {
				if let Some(session) = self.sessions.get(&peer_id) {
					warn!("[{}] unexpected packet {}", session.network.remote_address(), packet.name());
					session.network.disconnect(DisconnectionType::Kick);
				}
			}
		}
	}

	fn handle_auth_request(&mut self, peer_id: usize, request: AuthRequest) {
		let Some(session) = self.sessions.get(&peer_id) else { return };

		let fail = |session: &Session, error: AuthError| {
			session
				.network
				.send_packet(&Packet::AuthResponse(AuthResponse { result: Err(error) }));
			session.network.disconnect(DisconnectionType::Later);
		};

		let (major, minor, patch) = decode_version(request.game_version);
		info!("auth request from {:?} (version {major}.{minor}.{patch})", request.nickname);

		if request.game_version < PROTOCOL_REQUIRED_CLIENT_VERSION {
			warn!("{:?} authentication failed (version is too old)", request.nickname);
			return fail(session, AuthError::UpgradeRequired);
		}

		if request.game_version > GAME_VERSION {
			warn!("{:?} authentication failed (version is more recent than server's)", request.nickname);
			return fail(session, AuthError::ServerIsOutdated);
		}

		let is_authenticated = match (&self.configuration.connection_token, &request.connection_token) {
			(Some(expected), Some(token)) => {
				if connection_token_bytes(expected) != *token {
					warn!("{:?} authentication failed (invalid token)", request.nickname);
					return fail(session, AuthError::InvalidToken);
				}
				true
			}
			(Some(_), None) => {
				warn!("{:?} authentication failed (token required)", request.nickname);
				return fail(session, AuthError::InvalidToken);
			}
			(None, _) => false,
		};

		let nickname = request.nickname;
		if nickname.is_empty() || nickname.trim() != nickname || nickname.len() > PLAYER_MAX_NICKNAME_LENGTH {
			warn!("{nickname:?} authentication failed (malformed nickname)");
			return fail(session, AuthError::ProtocolError);
		}

		session.network.set_protocol_version(request.game_version);
		info!("{nickname} authenticated");

		let player_index = self.create_player(peer_id, nickname, is_authenticated);

		let Some(session) = self.sessions.get_mut(&peer_id) else { return };
		session
			.network
			.send_packet(&Packet::AuthResponse(AuthResponse { result: Ok(player_index) }));

		// Bootstrap data every fresh client needs before the first visibility dispatch
		session.network.send_packet(&Packet::NetworkStrings(self.string_store.to_packet()));
		session.network.send_packet(&Packet::EnvironmentCreate(EnvironmentCreate {
			tick_index: self.tick_index,
			id: 0,
			transform: EnvironmentTransform {
				translation: Vector3::zeros(),
				rotation: UnitQuaternion::identity(),
			},
		}));
		session
			.network
			.send_packet(&Packet::UpdateRootEnvironment(UpdateRootEnvironment { new_root: 0 }));

		session.handler = SessionHandler::Player(player_index);
	}

	fn handle_mine_block(&mut self, player_index: PlayerIndex, mine: MineBlock) {
		let Some(player) = self.players.get(player_index) else { return };
		let Some(chunk) = player.visibility.chunk_by_id(mine.chunk_id).cloned() else {
			return; // ignore
		};

		let indices = mine.location.indices();
		let size = chunk.size();
		if indices.x >= size.x || indices.y >= size.y || indices.z >= size.z {
			return;
		}

		// Only existing blocks can be mined
		if chunk.get_block(indices) == EMPTY_BLOCK {
			return;
		}

		chunk.update_block(indices, EMPTY_BLOCK);
	}

	fn handle_place_block(&mut self, player_index: PlayerIndex, place: PlaceBlock) {
		let Some(player) = self.players.get(player_index) else { return };
		let Some(chunk) = player.visibility.chunk_by_id(place.chunk_id).cloned() else {
			return; // ignore
		};

		let indices = place.location.indices();
		let size = chunk.size();
		if indices.x >= size.x || indices.y >= size.y || indices.z >= size.z {
			return;
		}

		// Target must be empty and the new block a real registered kind
		if chunk.get_block(indices) != EMPTY_BLOCK {
			return;
		}
		if place.new_block == EMPTY_BLOCK || place.new_block as usize >= self.block_library.len() {
			return;
		}

		// Check that nothing occupies the cell; a slightly smaller box allows a bit of overlap
		let block_center = self.planet.chunk_offset(chunk.indices()) + chunk.block_center(indices);
		let half_extent = chunk.block_size() * 0.75 * 0.5;
		let shape = Cuboid::new(Vector3::new(half_extent, half_extent, half_extent));
		let pose = nalgebra::Isometry3::translation(block_center.x, block_center.y, block_center.z);

		if self.physics.collision_query(&shape, &pose) {
			return;
		}

		chunk.update_block(indices, place.new_block);
	}

	fn handle_chat_message(&mut self, player_index: PlayerIndex, chat: SendChatMessage) {
		let message = chat.message;

		if message == "/respawn" {
			self.respawn(player_index);
			return;
		}

		if message == "/fly" {
			let Some(player) = self.players.get(player_index) else { return };
			let Some(character) = &player.character else { return };

			let flying = {
				let mut controller = character.controller.lock();
				let flying = !controller.is_flying();
				controller.enable_flying(flying);
				flying
			};

			if let Some(session) = self.sessions.get(&player.peer_id()) {
				session.network.send_packet(&Packet::ChatMessage(lodestone_shared::protocol::ChatMessage {
					player_index: None,
					message: if flying { "fly enabled" } else { "fly disabled" }.into(),
				}));
			}
			return;
		}

		if let Some(new_nickname) = message.strip_prefix("/nick ") {
			let new_nickname = new_nickname.trim();
			if new_nickname.is_empty() || new_nickname.len() > PLAYER_MAX_NICKNAME_LENGTH {
				return;
			}

			if let Some(player) = self.players.get_mut(player_index) {
				player.update_nickname(new_nickname.to_owned());
			}

			self.broadcast_to_players(&Packet::PlayerNameUpdate(PlayerNameUpdate {
				index: player_index,
				new_nickname: new_nickname.to_owned(),
			}));
			return;
		}

		self.broadcast_chat_message(message, Some(player_index));
	}
}

fn connection_token_bytes(secret: &str) -> [u8; CONNECTION_TOKEN_LENGTH] {
	let mut token = [0u8; CONNECTION_TOKEN_LENGTH];
	for (slot, byte) in token.iter_mut().zip(secret.as_bytes()) {
		*slot = *byte;
	}
	token
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::configuration::Configuration;
	use lodestone_shared::network::reactor::{OutgoingCommand, OutgoingEvent};
	use lodestone_shared::version::{build_version, GAME_VERSION};

	fn test_instance() -> ServerInstance {
		let configuration = Configuration {
			listen_address: Box::from("127.0.0.1:0"),
			..Configuration::default()
		};

		ServerInstance::new(configuration).expect("instance must start")
	}

	/// Plugs a fake peer into the instance and exposes the command stream it would send.
	fn attach_session(instance: &mut ServerInstance, peer_id: usize) -> crossbeam_channel::Receiver<OutgoingEvent> {
		let (outgoing, commands) = crossbeam_channel::unbounded();

		instance.sessions.insert(
			peer_id,
			Session {
				network: NetworkSession::new(peer_id, "127.0.0.1:9".parse().expect("address"), outgoing),
				handler: SessionHandler::Initial,
			},
		);

		commands
	}

	fn auth_request(game_version: u32, nickname: &str) -> Vec<u8> {
		Packet::AuthRequest(AuthRequest {
			game_version,
			nickname: nickname.to_owned(),
			connection_token: None,
		})
		.encode(game_version)
	}

	#[test]
	fn token_bytes_are_padded_and_truncated() {
		let short = connection_token_bytes("abc");
		assert_eq!(&short[..3], b"abc");
		assert!(short[3..].iter().all(|byte| *byte == 0));

		let long = connection_token_bytes(&"x".repeat(64));
		assert_eq!(long, [b'x'; CONNECTION_TOKEN_LENGTH]);
	}

	#[test]
	fn outdated_client_is_refused_then_disconnected_later() {
		let mut instance = test_instance();
		let commands = attach_session(&mut instance, 7);

		instance.handle_packet(7, &auth_request(build_version(0, 2, 0), "rusty"));

		// The refusal must be queued before the disconnect so it reaches the peer
		let first = commands.try_recv().expect("a response must be queued");
		let OutgoingCommand::Send(send) = first.command else {
			panic!("expected the auth response first");
		};
		let packet = Packet::decode(&send.payload, build_version(0, 2, 0)).expect("decode");
		assert_eq!(
			packet,
			Packet::AuthResponse(AuthResponse { result: Err(AuthError::UpgradeRequired) })
		);

		let second = commands.try_recv().expect("a disconnect must follow");
		assert!(matches!(
			second.command,
			OutgoingCommand::Disconnect(DisconnectionType::Later)
		));

		// No player was created for the refused peer
		assert!(instance.players.is_empty());
	}

	#[test]
	fn successful_auth_creates_a_player_and_swaps_the_handler() {
		let mut instance = test_instance();
		let commands = attach_session(&mut instance, 3);

		instance.handle_packet(3, &auth_request(GAME_VERSION, "lyra"));

		let session = instance.sessions.get(&3).expect("session must remain");
		let SessionHandler::Player(player_index) = session.handler else {
			panic!("the handler must have switched to the player state");
		};
		assert_eq!(session.network.protocol_version(), GAME_VERSION);

		let player = instance.players.get(player_index).expect("player must exist");
		assert_eq!(player.nickname(), "lyra");

		let first = commands.try_recv().expect("a response must be queued");
		let OutgoingCommand::Send(send) = first.command else {
			panic!("expected the auth response first");
		};
		assert_eq!(
			Packet::decode(&send.payload, GAME_VERSION).expect("decode"),
			Packet::AuthResponse(AuthResponse { result: Ok(player_index) })
		);
	}

	#[test]
	fn malformed_nickname_is_a_protocol_error() {
		let mut instance = test_instance();
		let commands = attach_session(&mut instance, 5);

		instance.handle_packet(5, &auth_request(GAME_VERSION, " padded "));

		let first = commands.try_recv().expect("a response must be queued");
		let OutgoingCommand::Send(send) = first.command else {
			panic!("expected the auth response first");
		};
		assert_eq!(
			Packet::decode(&send.payload, GAME_VERSION).expect("decode"),
			Packet::AuthResponse(AuthResponse { result: Err(AuthError::ProtocolError) })
		);
	}
}
