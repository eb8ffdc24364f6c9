//! Clientbound packet handling: feeds the world mirror, the player roster and the rotation
//! predictor. Anything the protocol does not allow clientbound is treated as a protocol error
//! and ends the connection.

use crate::prediction::RotationPredictor;
use crate::world::ClientWorld;
use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::constants::CHAT_MAX_LINES;
use lodestone_shared::network::{DisconnectionType, NetworkSession};
use lodestone_shared::protocol::{AuthError, EntitiesStateUpdate, NetworkStringStore, Packet, PlayerIndex};
use log::{error, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RemotePlayer {
	pub nickname: String,
	pub is_authenticated: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStage {
	Authenticating,
	Playing,
	Failed(AuthError),
}

pub struct ClientSessionHandler {
	pub world: ClientWorld,
	pub predictor: RotationPredictor,
	pub players: FxHashMap<PlayerIndex, RemotePlayer>,
	pub string_store: NetworkStringStore,

	/// Rolling chat history, newest last.
	pub chat_log: VecDeque<String>,

	pub stage: SessionStage,
	pub own_player_index: Option<PlayerIndex>,
	pub last_server_tick: u16,
}

impl ClientSessionHandler {
	#[must_use]
	pub fn new(block_library: Arc<BlockLibrary>) -> Self {
		Self {
			world: ClientWorld::new(block_library),
			predictor: RotationPredictor::new(),
			players: FxHashMap::default(),
			string_store: NetworkStringStore::new(),
			chat_log: VecDeque::new(),
			stage: SessionStage::Authenticating,
			own_player_index: None,
			last_server_tick: 0,
		}
	}

	pub fn handle_packet(&mut self, session: &NetworkSession, packet: Packet) {
		match packet {
			Packet::AuthResponse(response) => match response.result {
				Ok(player_index) => {
					info!("authenticated as player {player_index}");
					self.stage = SessionStage::Playing;
					self.own_player_index = Some(player_index);
					self.world.set_own_player_index(player_index);
				}
				Err(auth_error) => {
					error!("authentication failed: {auth_error:?}");
					self.stage = SessionStage::Failed(auth_error);
				}
			},

			Packet::ChatMessage(chat) => {
				let sender = chat
					.player_index
					.and_then(|index| self.players.get(&index))
					.map_or("server", |player| player.nickname.as_str());

				let line = format!("{sender}: {}", chat.message);
				info!("[chat] {line}");

				if self.chat_log.len() == CHAT_MAX_LINES {
					self.chat_log.pop_front();
				}
				self.chat_log.push_back(line);
			}

			Packet::ChunkCreate(create) => {
				self.last_server_tick = create.tick_index;
				self.world.apply_chunk_create(&create);
			}
			Packet::ChunkDestroy(destroy) => {
				self.last_server_tick = destroy.tick_index;
				self.world.apply_chunk_destroy(&destroy);
			}
			Packet::ChunkReset(reset) => {
				self.last_server_tick = reset.tick_index;
				if let Err(codec_error) = self.world.apply_chunk_reset(&reset) {
					error!("broken chunk payload: {codec_error}");
					session.disconnect(DisconnectionType::Normal);
				}
			}
			Packet::ChunkUpdate(update) => {
				self.last_server_tick = update.tick_index;
				self.world.apply_chunk_update(&update);
			}

			Packet::EntitiesCreation(creation) => {
				self.last_server_tick = creation.tick_index;
				self.world.apply_entities_creation(&creation);
			}
			Packet::EntitiesDelete(delete) => {
				self.last_server_tick = delete.tick_index;
				self.world.apply_entities_delete(&delete);
			}
			Packet::EntitiesStateUpdate(update) => self.handle_state_update(&update),

			Packet::NetworkStrings(strings) => self.string_store.apply(&strings),

			Packet::GameData(game_data) => {
				self.last_server_tick = game_data.tick_index;
				for player in game_data.players {
					self.players.insert(
						player.index,
						RemotePlayer {
							nickname: player.nickname,
							is_authenticated: player.is_authenticated,
						},
					);
				}
			}
			Packet::PlayerJoin(join) => {
				info!("{} joined", join.nickname);
				self.players.insert(
					join.index,
					RemotePlayer {
						nickname: join.nickname,
						is_authenticated: join.is_authenticated,
					},
				);
			}
			Packet::PlayerLeave(leave) => {
				if let Some(player) = self.players.remove(&leave.index) {
					info!("{} left", player.nickname);
				}
			}
			Packet::PlayerNameUpdate(update) => {
				if let Some(player) = self.players.get_mut(&update.index) {
					player.nickname = update.new_nickname;
				}
			}

			// The environment graph is a single root for now; nothing to track beyond accepting
			// the packets
			Packet::EnvironmentCreate(_)
			| Packet::EnvironmentDestroy(_)
			| Packet::EnvironmentUpdate(_)
			| Packet::EntityEnvironmentUpdate(_)
			| Packet::UpdateRootEnvironment(_) => {}

			unexpected => {
				warn!("received serverbound packet {} from the server", unexpected.name());
				session.disconnect(DisconnectionType::Kick);
			}
		}
	}

	/// Observed entities are applied verbatim; the controlled character goes through rotation
	/// reconciliation so locally predicted camera motion is never rolled back.
	fn handle_state_update(&mut self, update: &EntitiesStateUpdate) {
		self.last_server_tick = update.tick_index;
		self.world.apply_entities_state_update(update);

		if let Some(character) = &update.controlled_character {
			self.predictor
				.reconcile(update.last_input_index, character.camera_pitch, character.camera_yaw);

			let rotation = character.reference_rotation
				* UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.predictor.predicted_yaw().to_radians());
			self.world.set_controlled_transform(character.position, rotation);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::prediction::MovementInputs;
	use lodestone_shared::protocol::{
		AuthResponse, ControlledCharacterState, EntitiesCreation, EntityCreationData, EntityState,
		PlayerControlledData,
	};
	use lodestone_shared::version::GAME_VERSION;

	fn handler_and_session() -> (ClientSessionHandler, NetworkSession, crossbeam_channel::Receiver<lodestone_shared::network::OutgoingEvent>) {
		let (outgoing, commands) = crossbeam_channel::unbounded();
		let session = NetworkSession::new(0, "127.0.0.1:1".parse().expect("address"), outgoing);
		session.set_protocol_version(GAME_VERSION);

		(
			ClientSessionHandler::new(Arc::new(BlockLibrary::with_default_blocks())),
			session,
			commands,
		)
	}

	#[test]
	fn reconciliation_snaps_position_and_keeps_predicted_rotation() {
		let (mut handler, session, _commands) = handler_and_session();

		handler.handle_packet(&session, Packet::AuthResponse(AuthResponse { result: Ok(4) }));
		assert_eq!(handler.stage, SessionStage::Playing);

		handler.handle_packet(
			&session,
			Packet::EntitiesCreation(EntitiesCreation {
				tick_index: 1,
				entities: vec![EntityCreationData {
					entity_id: 11,
					initial_state: EntityState {
						position: Vector3::zeros(),
						rotation: UnitQuaternion::identity(),
					},
					player_controlled: Some(PlayerControlledData { controlling_player: 4 }),
				}],
			}),
		);
		assert_eq!(handler.world.controlled_entity, Some(11));

		// Predict three +5° pitch inputs
		for _ in 0..3 {
			handler.predictor.accumulate_rotation(5.0, 0.0);
			handler.predictor.sample_inputs(MovementInputs::default());
		}
		assert_eq!(handler.predictor.predicted_pitch(), 15.0);

		// Server acknowledges the first input and an authoritative position
		handler.handle_packet(
			&session,
			Packet::EntitiesStateUpdate(EntitiesStateUpdate {
				tick_index: 2,
				last_input_index: 1,
				controlled_character: Some(ControlledCharacterState {
					camera_pitch: 5.0,
					camera_yaw: 0.0,
					reference_rotation: UnitQuaternion::identity(),
					position: Vector3::new(3.0, 2.0, 1.0),
				}),
				entities: vec![],
			}),
		);

		assert_eq!(handler.predictor.predicted_pitch(), 15.0);
		let entity = handler.world.entity(11).expect("controlled entity must exist");
		assert_eq!(entity.position, Vector3::new(3.0, 2.0, 1.0));
	}
}
