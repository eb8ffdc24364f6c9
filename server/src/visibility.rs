//! Per-session authoritative view of the world.
//!
//! Tracks which chunks and entities one client has been told about and, once per tick, emits
//! exactly the packets needed to converge that client to the current server state. Chunk ids and
//! entity ids are session-local u16s allocated from growable free-id bitsets.
//!
//! Full chunk contents (`ChunkReset`) are bandwidth-gated: at most
//! [`MAX_CONCURRENT_CHUNK_UPDATE`] reset packets may be unacknowledged per session, and when more
//! chunks want a reset than the cap allows, the ones closest to the controlled character win.

use crate::entities::{Entities, EntityHandle, PlayerIndex};
use bit_vec::BitVec;
use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::character::CharacterController;
use lodestone_shared::chunk::{Chunk, ChunkIndices};
use lodestone_shared::codec;
use lodestone_shared::constants::MAX_CONCURRENT_CHUNK_UPDATE;
use lodestone_shared::inputs::InputIndex;
use lodestone_shared::network::NetworkSession;
use lodestone_shared::protocol::{
	BlockUpdateEntry, ChunkCreate, ChunkDestroy, ChunkReset, ChunkUpdate, ControlledCharacterState,
	EntitiesCreation, EntitiesDelete, EntitiesStateUpdate, EntityCreationData, EntityState, EntityStateData, Packet,
	PlayerControlledData, VoxelLocation,
};
use lodestone_shared::signal::SlotId;
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;

const FREE_CHUNK_ID_GROW_RATE: usize = 128;
const FREE_ENTITY_ID_GROW_RATE: usize = 128;

#[derive(Clone, Debug)]
pub struct CreateEntityData {
	pub initial_position: Vector3<f32>,
	pub initial_rotation: UnitQuaternion<f32>,
	pub is_moving: bool,
	pub player_controlled: Option<PlayerIndex>,
}

/// What a visible chunk still owes the client. Shared with the chunk's update signal, which runs
/// while the chunk's write lock is held, so only this small state is touched there.
struct PendingChunkState {
	/// The full content differs from what the client has; dominates `updates`.
	reset: bool,
	/// Coalesced single-cell updates, sorted by cell position so repeated writes to one cell
	/// overwrite in place.
	updates: Vec<BlockUpdateEntry>,
}

struct VisibleChunk {
	chunk: Arc<Chunk>,
	state: Arc<Mutex<PendingChunkState>>,
	update_slot: Option<SlotId>,
	reset_slot: Option<SlotId>,
}

impl VisibleChunk {
	fn disconnect(&mut self) {
		if let Some(slot) = self.update_slot.take() {
			self.chunk.on_block_updated.disconnect(slot);
		}
		if let Some(slot) = self.reset_slot.take() {
			self.chunk.on_reset.disconnect(slot);
		}
	}
}

pub struct SessionVisibilityHandler {
	chunk_ids: FxHashMap<ChunkIndices, u16>,
	visible_chunks: Vec<Option<VisibleChunk>>,
	free_chunk_ids: BitVec,
	newly_visible: BitVec,
	newly_hidden: BitVec,

	entity_ids: FxHashMap<EntityHandle, u16>,
	created_entities: Vec<(EntityHandle, CreateEntityData)>,
	moving_entities: FxHashSet<EntityHandle>,
	deleted_entities: FxHashSet<EntityHandle>,
	free_entity_ids: BitVec,

	controlled_entity: Option<EntityHandle>,
	controlled_character: Option<Arc<Mutex<CharacterController>>>,

	active_chunk_updates: Arc<AtomicUsize>,
	last_input_index: InputIndex,
}

impl SessionVisibilityHandler {
	#[must_use]
	pub fn new() -> Self {
		Self {
			chunk_ids: FxHashMap::default(),
			visible_chunks: vec![],
			free_chunk_ids: BitVec::new(),
			newly_visible: BitVec::new(),
			newly_hidden: BitVec::new(),

			entity_ids: FxHashMap::default(),
			created_entities: vec![],
			moving_entities: FxHashSet::default(),
			deleted_entities: FxHashSet::default(),
			free_entity_ids: BitVec::new(),

			controlled_entity: None,
			controlled_character: None,

			active_chunk_updates: Arc::new(AtomicUsize::new(0)),
			last_input_index: 0,
		}
	}

	pub fn create_chunk(&mut self, chunk: &Arc<Chunk>) {
		if let Some(chunk_id) = self.chunk_ids.get(&chunk.indices()) {
			// Marked hidden earlier this tick, resurrect it
			self.newly_hidden.set(*chunk_id as usize, false);
			return;
		}

		let chunk_id = self.allocate_chunk_id();

		self.chunk_ids.insert(chunk.indices(), chunk_id);
		self.newly_visible.set(chunk_id as usize, true);

		self.visible_chunks[chunk_id as usize] = Some(VisibleChunk {
			chunk: chunk.clone(),
			state: Arc::new(Mutex::new(PendingChunkState { reset: false, updates: vec![] })),
			update_slot: None,
			reset_slot: None,
		});
	}

	pub fn destroy_chunk(&mut self, chunk: &Chunk) {
		let Some(chunk_id) = self.chunk_ids.get(&chunk.indices()).copied() else {
			return;
		};

		if self.newly_visible.get(chunk_id as usize).unwrap_or(false) {
			// Never announced, dismiss it entirely and release the id right away
			self.newly_visible.set(chunk_id as usize, false);
			self.chunk_ids.remove(&chunk.indices());
			if let Some(mut visible) = self.visible_chunks[chunk_id as usize].take() {
				visible.disconnect();
			}
			self.free_chunk_ids.set(chunk_id as usize, true);
			return;
		}

		self.newly_hidden.set(chunk_id as usize, true);
	}

	#[must_use]
	pub fn chunk_by_id(&self, chunk_id: u16) -> Option<&Arc<Chunk>> {
		self.visible_chunks
			.get(chunk_id as usize)?
			.as_ref()
			.map(|visible| &visible.chunk)
	}

	pub fn create_entity(&mut self, entity: EntityHandle, data: CreateEntityData) {
		if data.is_moving && self.controlled_entity != Some(entity) {
			self.moving_entities.insert(entity);
		}

		self.created_entities.push((entity, data));
	}

	pub fn destroy_entity(&mut self, entity: EntityHandle) {
		let was_pending = {
			let before = self.created_entities.len();
			self.created_entities.retain(|(handle, _)| *handle != entity);
			self.created_entities.len() != before
		};
		self.moving_entities.remove(&entity);

		if !was_pending && self.entity_ids.contains_key(&entity) {
			self.deleted_entities.insert(entity);
		}
	}

	/// Ties the session to its player character so reconciliation state can be sent each tick.
	pub fn update_controlled_entity(
		&mut self,
		entity: Option<EntityHandle>,
		controller: Option<Arc<Mutex<CharacterController>>>,
	) {
		if let Some(entity) = entity {
			self.moving_entities.remove(&entity);
		}

		self.controlled_entity = entity;
		self.controlled_character = controller;
	}

	pub fn update_last_input_index(&mut self, index: InputIndex) {
		self.last_input_index = index;
	}

	#[must_use]
	pub const fn last_input_index(&self) -> InputIndex {
		self.last_input_index
	}

	/// One call per tick. Produces at most one packet of each kind, in a fixed order: entity
	/// deletes, entity creates, chunk destroys, chunk creates, chunk resets (bandwidth gated),
	/// chunk updates, entity state update.
	pub fn dispatch(&mut self, tick_index: u16, session: &NetworkSession, entities: &Entities, block_library: &BlockLibrary) {
		self.dispatch_entity_deletes(tick_index, session);
		self.dispatch_entity_creates(tick_index, session);

		let freed_chunk_ids = self.dispatch_chunk_destroys(tick_index, session);
		self.dispatch_chunk_creates(tick_index, session);
		self.dispatch_chunk_resets(tick_index, session, block_library);
		self.dispatch_chunk_updates(tick_index, session);

		self.dispatch_entity_states(tick_index, session, entities);

		// Ids freed only now, after dispatch, so a destroy+create in the same tick can never
		// reuse an id the client still associates with the old chunk
		for chunk_id in freed_chunk_ids {
			self.free_chunk_ids.set(chunk_id as usize, true);
		}
	}

	fn dispatch_entity_deletes(&mut self, tick_index: u16, session: &NetworkSession) {
		if self.deleted_entities.is_empty() {
			return;
		}

		let mut packet = EntitiesDelete { tick_index, entities: vec![] };

		for entity in self.deleted_entities.drain() {
			if let Some(entity_id) = self.entity_ids.remove(&entity) {
				packet.entities.push(entity_id);
				self.free_entity_ids.set(entity_id as usize, true);
			}
		}

		session.send_packet(&Packet::EntitiesDelete(packet));
	}

	fn dispatch_entity_creates(&mut self, tick_index: u16, session: &NetworkSession) {
		if self.created_entities.is_empty() {
			return;
		}

		let mut packet = EntitiesCreation { tick_index, entities: vec![] };

		for (entity, data) in std::mem::take(&mut self.created_entities) {
			let entity_id = self.allocate_entity_id();
			self.entity_ids.insert(entity, entity_id);

			packet.entities.push(EntityCreationData {
				entity_id,
				initial_state: EntityState {
					position: data.initial_position,
					rotation: data.initial_rotation,
				},
				player_controlled: data
					.player_controlled
					.map(|controlling_player| PlayerControlledData { controlling_player }),
			});
		}

		session.send_packet(&Packet::EntitiesCreation(packet));
	}

	fn dispatch_chunk_destroys(&mut self, tick_index: u16, session: &NetworkSession) -> Vec<u16> {
		let mut freed = vec![];

		for chunk_id in set_bits(&self.newly_hidden) {
			let Some(mut visible) = self.visible_chunks[chunk_id].take() else {
				continue;
			};
			visible.disconnect();

			self.chunk_ids.remove(&visible.chunk.indices());
			freed.push(chunk_id as u16);

			session.send_packet(&Packet::ChunkDestroy(ChunkDestroy { tick_index, chunk_id: chunk_id as u16 }));
		}

		self.newly_hidden.clear();
		freed
	}

	fn dispatch_chunk_creates(&mut self, tick_index: u16, session: &NetworkSession) {
		for chunk_id in set_bits(&self.newly_visible) {
			let Some(visible) = &mut self.visible_chunks[chunk_id] else {
				continue;
			};

			// Connect the signals only now so edits made earlier this tick are covered by the
			// full reset below rather than duplicated as incremental updates
			let state = visible.state.clone();
			visible.update_slot = Some(visible.chunk.on_block_updated.connect(move |update| {
				let mut state = state.lock();
				if state.reset {
					return;
				}

				let key = (update.indices.x, update.indices.y, update.indices.z);
				let position = state
					.updates
					.binary_search_by_key(&key, |entry| (entry.location.x as u32, entry.location.y as u32, entry.location.z as u32));

				match position {
					Ok(found) => state.updates[found].new_block = update.new_block,
					Err(insert_at) => state.updates.insert(
						insert_at,
						BlockUpdateEntry {
							location: VoxelLocation::from_indices(update.indices),
							new_block: update.new_block,
						},
					),
				}
			}));

			let state = visible.state.clone();
			visible.reset_slot = Some(visible.chunk.on_reset.connect(move |()| {
				let mut state = state.lock();
				state.reset = true;
				state.updates.clear();
			}));

			session.send_packet(&Packet::ChunkCreate(ChunkCreate {
				tick_index,
				chunk_id: chunk_id as u16,
				location: visible.chunk.indices(),
				size: visible.chunk.size(),
				tile_size: visible.chunk.block_size(),
			}));

			visible.state.lock().reset = true;
		}

		self.newly_visible.clear();
	}

	fn dispatch_chunk_resets(&mut self, tick_index: u16, session: &NetworkSession, block_library: &BlockLibrary) {
		let mut candidates: Vec<(usize, Vector3<f32>)> = self
			.visible_chunks
			.iter()
			.enumerate()
			.filter_map(|(chunk_id, visible)| {
				let visible = visible.as_ref()?;
				if !visible.state.lock().reset {
					return None;
				}

				let chunk = &visible.chunk;
				let extent = chunk.size().cast::<f32>() * chunk.block_size();
				let center = (chunk.indices().cast::<f32>() + Vector3::new(0.5, 0.5, 0.5)).component_mul(&extent);
				Some((chunk_id, center))
			})
			.collect();

		// Closer chunks get the limited reset slots first
		if let Some(controller) = &self.controlled_character {
			let reference = controller.lock().position();
			candidates.sort_by(|(_, a), (_, b)| {
				let a = (a - reference).norm_squared();
				let b = (b - reference).norm_squared();
				a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
			});
		}

		for (chunk_id, _) in candidates {
			if self.active_chunk_updates.load(Relaxed) >= MAX_CONCURRENT_CHUNK_UPDATE {
				// Cap reached, remaining chunks keep their reset flag and retry next tick
				return;
			}

			let Some(visible) = &self.visible_chunks[chunk_id] else { continue };

			let mut content = vec![];
			codec::serialize_chunk(&visible.chunk.read(), block_library, &mut content);

			self.active_chunk_updates.fetch_add(1, Relaxed);
			let active_chunk_updates = self.active_chunk_updates.clone();

			session.send_packet_acknowledged(
				&Packet::ChunkReset(ChunkReset { tick_index, chunk_id: chunk_id as u16, content }),
				move || {
					active_chunk_updates.fetch_sub(1, Relaxed);
				},
			);

			visible.state.lock().reset = false;
		}
	}

	fn dispatch_chunk_updates(&mut self, tick_index: u16, session: &NetworkSession) {
		for (chunk_id, visible) in self.visible_chunks.iter().enumerate() {
			let Some(visible) = visible else { continue };

			let updates = {
				let mut state = visible.state.lock();
				if state.reset || state.updates.is_empty() {
					continue;
				}
				std::mem::take(&mut state.updates)
			};

			session.send_packet(&Packet::ChunkUpdate(ChunkUpdate { tick_index, chunk_id: chunk_id as u16, updates }));
		}
	}

	fn dispatch_entity_states(&mut self, tick_index: u16, session: &NetworkSession, entities: &Entities) {
		let mut packet = EntitiesStateUpdate {
			tick_index,
			last_input_index: self.last_input_index,
			controlled_character: None,
			entities: vec![],
		};

		if let Some(controller) = &self.controlled_character {
			let controller = controller.lock();
			packet.controlled_character = Some(ControlledCharacterState {
				camera_pitch: controller.camera_pitch(),
				camera_yaw: controller.camera_yaw(),
				reference_rotation: controller.reference_rotation(),
				position: controller.position(),
			});
		}

		for entity in &self.moving_entities {
			let Some(entity_id) = self.entity_ids.get(entity) else { continue };
			let Some(record) = entities.get(*entity) else { continue };

			packet.entities.push(EntityStateData {
				entity_id: *entity_id,
				state: EntityState {
					position: record.position,
					rotation: record.rotation,
				},
			});
		}

		if packet.controlled_character.is_some() || !packet.entities.is_empty() {
			session.send_packet(&Packet::EntitiesStateUpdate(packet));
		}
	}

	fn allocate_chunk_id(&mut self) -> u16 {
		let free = set_bits(&self.free_chunk_ids).next();
		let chunk_id = match free {
			Some(chunk_id) => chunk_id,
			None => {
				let chunk_id = self.free_chunk_ids.len();
				self.free_chunk_ids.grow(FREE_CHUNK_ID_GROW_RATE, true);
				chunk_id
			}
		};

		self.free_chunk_ids.set(chunk_id, false);

		if chunk_id >= self.visible_chunks.len() {
			self.visible_chunks.resize_with(chunk_id + 1, || None);
		}
		if chunk_id >= self.newly_visible.len() {
			self.newly_visible.grow(chunk_id + 1 - self.newly_visible.len(), false);
			self.newly_hidden.grow(chunk_id + 1 - self.newly_hidden.len(), false);
		}

		chunk_id as u16
	}

	fn allocate_entity_id(&mut self) -> u16 {
		let free = set_bits(&self.free_entity_ids).next();
		let entity_id = match free {
			Some(entity_id) => entity_id,
			None => {
				let entity_id = self.free_entity_ids.len();
				self.free_entity_ids.grow(FREE_ENTITY_ID_GROW_RATE, true);
				entity_id
			}
		};

		self.free_entity_ids.set(entity_id, false);
		entity_id as u16
	}
}

impl Default for SessionVisibilityHandler {
	fn default() -> Self {
		Self::new()
	}
}

fn set_bits(bits: &BitVec) -> impl Iterator<Item = usize> + '_ {
	bits.iter().enumerate().filter_map(|(index, set)| set.then_some(index))
}
