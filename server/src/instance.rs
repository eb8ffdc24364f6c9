//! The authoritative simulation: fixed-step tick loop, player lifecycle, periodic persistence.

use crate::chunk_entities::ChunkEntities;
use crate::configuration::Configuration;
use crate::entities::{Entities, EntityHandle, PlayerIndex};
use crate::persistence;
use crate::player::{PlayerCharacter, PlayerPool, ServerPlayer};
use crate::session::{Session, SessionHandler};
use crate::visibility::CreateEntityData;
use lodestone_shared::blocks::{BlockLibrary, DIRECTIONS};
use lodestone_shared::character::{CharacterController, GravitySource};
use lodestone_shared::chunk::ChunkIndices;
use lodestone_shared::constants::{
	PLAYER_CAPSULE_HEIGHT, PLAYER_COLLIDER_RADIUS, SAVE_INTERVAL, TICK_DURATION,
};
use lodestone_shared::network::{IncomingEvent, NetworkReactor, NetworkSession, ReactorError};
use lodestone_shared::physics::{Physics, TaskScheduler};
use lodestone_shared::planet::Planet;
use lodestone_shared::protocol::{ChatMessage, GameData, GameDataPlayer, NetworkStringStore, Packet, PlayerJoin, PlayerLeave};
use log::{info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const PLANET_GRID: u32 = 128;
const PLANET_CORNER_RADIUS: f32 = 16.0;
const PLANET_GRAVITY: f32 = 9.81;

#[derive(Debug, Error)]
pub enum InstanceError {
	#[error("invalid listen address: {0}")]
	ListenAddress(#[from] std::net::AddrParseError),

	#[error(transparent)]
	Reactor(#[from] ReactorError),
}

pub struct ServerInstance {
	pub configuration: Configuration,

	pub block_library: Arc<BlockLibrary>,
	pub planet: Arc<Planet>,
	pub physics: Physics,
	scheduler: TaskScheduler,
	pub entities: Entities,
	chunk_entities: ChunkEntities,

	reactor: NetworkReactor,
	pub sessions: FxHashMap<usize, Session>,
	pub players: PlayerPool,
	pub string_store: NetworkStringStore,

	new_players: Vec<PlayerIndex>,
	disconnected_players: Vec<PlayerIndex>,

	dirty_chunks: Arc<Mutex<FxHashSet<ChunkIndices>>>,
	save_directory: PathBuf,
	save_clock: Instant,

	pub tick_index: u16,
	tick_accumulator: Duration,
}

impl ServerInstance {
	pub fn new(configuration: Configuration) -> Result<Self, InstanceError> {
		let block_library = Arc::new(BlockLibrary::with_default_blocks());

		let mut planet = Planet::new(
			Vector3::new(PLANET_GRID, PLANET_GRID, PLANET_GRID),
			1.0,
			PLANET_CORNER_RADIUS,
			PLANET_GRAVITY,
		);
		planet.generate_chunks(&block_library, configuration.world_seed);

		// One landing platform per face, sitting on the terrain surface
		let surface = (PLANET_GRID / 2 - 16) as i64;
		for direction in DIRECTIONS {
			let center = direction.normal().map(|v| v.round() as i64) * surface;
			planet.generate_platform(&block_library, direction, center);
		}

		let save_directory = PathBuf::from(&*configuration.save_directory);
		persistence::load_chunks(&save_directory, &planet, &block_library);

		// Subscribed only now, so generation and loading don't mark the whole planet dirty
		let dirty_chunks = Arc::new(Mutex::new(FxHashSet::default()));
		let slot_dirty = dirty_chunks.clone();
		planet.on_chunk_updated.connect(move |indices: &ChunkIndices| {
			slot_dirty.lock().insert(*indices);
		});

		let planet = Arc::new(planet);
		let mut physics = Physics::new();
		let scheduler = TaskScheduler::new();
		let chunk_entities = ChunkEntities::new(&mut physics, &planet, &block_library, &scheduler);

		let mut string_store = NetworkStringStore::new();
		for name in block_library.names() {
			string_store.register(name);
		}

		let listen_address: SocketAddr = configuration.listen_address.parse()?;
		let reactor = NetworkReactor::new(Some(listen_address), 0, configuration.max_players)?;
		info!("listening on {listen_address}");

		Ok(Self {
			configuration,
			block_library,
			planet,
			physics,
			scheduler,
			entities: Entities::new(),
			chunk_entities,
			reactor,
			sessions: FxHashMap::default(),
			players: PlayerPool::new(),
			string_store,
			new_players: vec![],
			disconnected_players: vec![],
			dirty_chunks,
			save_directory,
			save_clock: Instant::now(),
			tick_index: 0,
			tick_accumulator: Duration::ZERO,
		})
	}

	/// The actual listen address, useful when the configuration asked for port 0.
	#[must_use]
	pub fn listen_address(&self) -> Option<SocketAddr> {
		self.reactor.local_address()
	}

	pub fn run(mut self) -> ! {
		let mut last_update = Instant::now();

		loop {
			let now = Instant::now();
			let elapsed = now - last_update;
			last_update = now;

			let next_update = self.update(elapsed);
			thread::sleep(next_update);
		}
	}

	/// One outer loop iteration: poll the network, run as many fixed ticks as the accumulator
	/// allows, report how long to sleep.
	pub fn update(&mut self, elapsed: Duration) -> Duration {
		if self.save_clock.elapsed() >= SAVE_INTERVAL {
			self.save_clock = Instant::now();
			self.on_save();
		}

		self.poll_network();

		// No player? Idle instead of spinning
		if self.players.is_empty() {
			return Duration::from_millis(100);
		}

		self.tick_accumulator += elapsed;
		while self.tick_accumulator >= TICK_DURATION {
			self.on_tick();
			self.tick_accumulator -= TICK_DURATION;
		}

		TICK_DURATION - self.tick_accumulator
	}

	fn poll_network(&mut self) {
		while let Some(event) = self.reactor.try_receive() {
			match event {
				IncomingEvent::Connect { peer_id, remote_address, .. } => {
					info!("[{remote_address}] connected");
					self.sessions.insert(
						peer_id,
						Session {
							network: NetworkSession::new(peer_id, remote_address, self.reactor.outgoing_sender()),
							handler: SessionHandler::Initial,
						},
					);
				}
				IncomingEvent::Disconnect { peer_id, timeout } => {
					if let Some(session) = self.sessions.remove(&peer_id) {
						info!(
							"[{}] disconnected{}",
							session.network.remote_address(),
							if timeout { " (timeout)" } else { "" }
						);

						if let SessionHandler::Player(player_index) = session.handler {
							self.destroy_player(player_index);
						}
					}
				}
				IncomingEvent::Packet { peer_id, payload, .. } => {
					self.handle_packet(peer_id, &payload);
				}
				IncomingEvent::PeerInfo { info, callback, .. } => callback(info),
			}
		}
	}

	fn on_tick(&mut self) {
		self.tick_index = self.tick_index.wrapping_add(1);

		for player in self.players.iter_mut() {
			player.tick();
		}

		self.chunk_entities
			.update(&mut self.physics, &self.planet, &self.block_library, &self.scheduler);

		self.physics.step(TICK_DURATION.as_secs_f32());

		// Mirror simulated character poses into the entity records the visibility handlers read
		let poses: Vec<(EntityHandle, Vector3<f32>, UnitQuaternion<f32>)> = self
			.players
			.iter()
			.filter_map(|player| {
				let entity = player.controlled_entity?;
				let character = player.character.as_ref()?;
				let controller = character.controller.lock();
				Some((entity, controller.position(), controller.rotation()))
			})
			.collect();

		for (entity, position, rotation) in poses {
			if let Some(record) = self.entities.get_mut(entity) {
				record.position = position;
				record.rotation = rotation;
			}
		}

		self.on_network_tick();
	}

	fn on_network_tick(&mut self) {
		for player_index in std::mem::take(&mut self.disconnected_players) {
			self.broadcast_to_players(&Packet::PlayerLeave(PlayerLeave { index: player_index }));
		}

		let new_players = std::mem::take(&mut self.new_players);
		for player_index in &new_players {
			let Some(player) = self.players.get(*player_index) else { continue };

			let joined = Packet::PlayerJoin(PlayerJoin {
				index: *player_index,
				nickname: player.nickname().to_owned(),
				is_authenticated: player.is_authenticated(),
			});

			// Tell everyone already present about the newcomer...
			for other in self.players.iter() {
				if new_players.contains(&other.player_index()) {
					continue;
				}
				if let Some(session) = self.sessions.get(&other.peer_id()) {
					session.network.send_packet(&joined);
				}
			}

			// ...and give the newcomer the current roster
			if let Some(session) = self.sessions.get(&player.peer_id()) {
				let mut game_data = GameData { tick_index: self.tick_index, players: vec![] };
				for other in self.players.iter() {
					game_data.players.push(GameDataPlayer {
						index: other.player_index(),
						nickname: other.nickname().to_owned(),
						is_authenticated: other.is_authenticated(),
					});
				}

				session.network.send_packet(&Packet::GameData(game_data));
			}
		}

		for player_index in self.players.indices() {
			let Some(player) = self.players.get_mut(player_index) else { continue };
			let Some(session) = self.sessions.get(&player.peer_id()) else { continue };

			player
				.visibility
				.dispatch(self.tick_index, &session.network, &self.entities, &self.block_library);
		}
	}

	fn on_save(&mut self) {
		let dirty: Vec<ChunkIndices> = {
			let mut dirty = self.dirty_chunks.lock();
			dirty.drain().collect()
		};

		if dirty.is_empty() {
			return;
		}

		info!("saving {} dirty chunks", dirty.len());

		for indices in dirty {
			if let Err(error) = persistence::save_chunk(&self.save_directory, &self.planet, &self.block_library, indices) {
				warn!("failed to save chunk {indices:?}: {error}");
				// Stays dirty, retried on the next save interval
				self.dirty_chunks.lock().insert(indices);
			}
		}
	}

	pub fn create_player(&mut self, peer_id: usize, nickname: String, is_authenticated: bool) -> PlayerIndex {
		let player_index = self
			.players
			.insert(|player_index| ServerPlayer::new(player_index, peer_id, nickname, is_authenticated));

		// A fresh session starts out knowing about every chunk of the planet
		if let Some(player) = self.players.get_mut(player_index) {
			for chunk in self.planet.chunks() {
				player.visibility.create_chunk(chunk);
			}

			// Existing entities too
			let known: Vec<_> = self
				.entities
				.iter()
				.map(|(handle, record)| (handle, record.clone()))
				.collect();
			for (handle, record) in known {
				player.visibility.create_entity(
					handle,
					CreateEntityData {
						initial_position: record.position,
						initial_rotation: record.rotation,
						is_moving: record.is_moving,
						player_controlled: record.controlled_by,
					},
				);
			}
		}

		self.new_players.push(player_index);
		self.respawn(player_index);

		player_index
	}

	pub fn respawn(&mut self, player_index: PlayerIndex) {
		self.despawn_controlled_entity(player_index);

		let spawn_position = self.planet.center() + Vector3::new(0.5, 0.5, self.planet.half_extent().z - 12.0);
		let spawn_rotation = UnitQuaternion::identity();

		let gravity: Arc<dyn GravitySource> = self.planet.clone();
		let controller = Arc::new(Mutex::new(CharacterController::new(Some(gravity))));
		controller.lock().reset_pose(spawn_position, spawn_rotation);

		let character_handle = self.physics.add_character(
			spawn_position,
			spawn_rotation,
			PLAYER_CAPSULE_HEIGHT * 0.5,
			PLAYER_COLLIDER_RADIUS,
			controller.clone(),
		);

		let entity = self.entities.spawn(crate::entities::EntityRecord {
			position: spawn_position,
			rotation: spawn_rotation,
			is_moving: true,
			controlled_by: Some(player_index),
		});

		for player in self.players.iter_mut() {
			player.visibility.create_entity(
				entity,
				CreateEntityData {
					initial_position: spawn_position,
					initial_rotation: spawn_rotation,
					is_moving: true,
					player_controlled: Some(player_index),
				},
			);
		}

		if let Some(player) = self.players.get_mut(player_index) {
			player.controlled_entity = Some(entity);
			player.character = Some(PlayerCharacter {
				controller: controller.clone(),
				handle: character_handle,
			});
			player.visibility.update_controlled_entity(Some(entity), Some(controller));
		}
	}

	fn despawn_controlled_entity(&mut self, player_index: PlayerIndex) {
		let Some(player) = self.players.get_mut(player_index) else { return };

		let entity = player.controlled_entity.take();
		let character = player.character.take();
		player.visibility.update_controlled_entity(None, None);

		if let Some(character) = character {
			self.physics.remove_character(character.handle);
		}

		if let Some(entity) = entity {
			self.entities.despawn(entity);
			for player in self.players.iter_mut() {
				player.visibility.destroy_entity(entity);
			}
		}
	}

	pub fn destroy_player(&mut self, player_index: PlayerIndex) {
		self.despawn_controlled_entity(player_index);

		if self.players.remove(player_index).is_some() {
			self.disconnected_players.push(player_index);
		}
	}

	pub fn broadcast_to_players(&self, packet: &Packet) {
		for player in self.players.iter() {
			if let Some(session) = self.sessions.get(&player.peer_id()) {
				session.network.send_packet(packet);
			}
		}
	}

	pub fn broadcast_chat_message(&self, message: String, sender: Option<PlayerIndex>) {
		self.broadcast_to_players(&Packet::ChatMessage(ChatMessage { player_index: sender, message }));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lodestone_shared::network::INVALID_PEER_ID;
	use lodestone_shared::protocol::AuthRequest;
	use lodestone_shared::version::GAME_VERSION;

	#[test]
	fn a_client_receives_the_full_world_after_authenticating() {
		let configuration = Configuration {
			listen_address: Box::from("127.0.0.1:0"),
			..Configuration::default()
		};
		let mut instance = ServerInstance::new(configuration).expect("instance must start");
		let address = instance.listen_address().expect("the server must be listening");

		let client = NetworkReactor::new(None, 1000, 1).expect("client reactor");
		let peer_id = client.connect_to(address);
		assert_ne!(peer_id, INVALID_PEER_ID);

		let session = NetworkSession::new(peer_id, address, client.outgoing_sender());
		session.set_protocol_version(GAME_VERSION);
		session.send_packet(&Packet::AuthRequest(AuthRequest {
			game_version: GAME_VERSION,
			nickname: "probe".into(),
			connection_token: None,
		}));

		let expected_chunks = instance.planet.chunk_count();
		let mut authenticated = false;
		let mut creates = 0usize;
		let mut resets = 0usize;

		// Drive the server loop by hand until the whole world arrived or we give up
		let deadline = Instant::now() + Duration::from_secs(30);
		while (!authenticated || creates < expected_chunks || resets < expected_chunks) && Instant::now() < deadline {
			instance.update(TICK_DURATION);

			while let Some(event) = client.try_receive() {
				let IncomingEvent::Packet { payload, .. } = event else { continue };

				match Packet::decode(&payload, GAME_VERSION).expect("server packets must decode") {
					Packet::AuthResponse(response) => {
						response.result.expect("authentication must succeed");
						authenticated = true;
					}
					Packet::ChunkCreate(_) => creates += 1,
					Packet::ChunkReset(_) => resets += 1,
					_ => {}
				}
			}

			thread::sleep(Duration::from_millis(2));
		}

		assert!(authenticated, "the auth response must arrive");
		assert_eq!(creates, expected_chunks, "every chunk must be announced exactly once");
		assert_eq!(resets, expected_chunks, "every chunk's content must arrive despite the in-flight cap");
	}
}
