//! Client-side mirror of the server's world: chunks keyed by their session-local network id and
//! entities keyed by their network id, fed exclusively by clientbound packets.

use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::chunk::Chunk;
use lodestone_shared::codec::{self, CodecError};
use lodestone_shared::protocol::{
	ChunkCreate, ChunkDestroy, ChunkId, ChunkReset, ChunkUpdate, EntitiesCreation, EntitiesDelete,
	EntitiesStateUpdate, EntityId, PlayerIndex,
};
use nalgebra::{UnitQuaternion, Vector3};
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub struct ClientChunk {
	pub chunk: Arc<Chunk>,
}

#[derive(Clone, Debug)]
pub struct ClientEntity {
	pub position: Vector3<f32>,
	pub rotation: UnitQuaternion<f32>,
	pub controlled_by: Option<PlayerIndex>,
}

pub struct ClientWorld {
	block_library: Arc<BlockLibrary>,

	chunks: Vec<Option<ClientChunk>>,
	entities: FxHashMap<EntityId, ClientEntity>,

	/// Entity controlled by this client, per the server's creation packets.
	pub controlled_entity: Option<EntityId>,
	own_player_index: Option<PlayerIndex>,
}

impl ClientWorld {
	#[must_use]
	pub fn new(block_library: Arc<BlockLibrary>) -> Self {
		Self {
			block_library,
			chunks: vec![],
			entities: FxHashMap::default(),
			controlled_entity: None,
			own_player_index: None,
		}
	}

	pub fn set_own_player_index(&mut self, player_index: PlayerIndex) {
		self.own_player_index = Some(player_index);
	}

	#[must_use]
	pub fn chunk(&self, chunk_id: u16) -> Option<&Arc<Chunk>> {
		self.chunks.get(chunk_id as usize)?.as_ref().map(|client| &client.chunk)
	}

	#[must_use]
	pub fn chunk_count(&self) -> usize {
		self.chunks.iter().filter(|chunk| chunk.is_some()).count()
	}

	pub fn chunks(&self) -> impl Iterator<Item = (ChunkId, &Arc<Chunk>)> {
		self.chunks
			.iter()
			.enumerate()
			.filter_map(|(chunk_id, slot)| slot.as_ref().map(|client| (chunk_id as ChunkId, &client.chunk)))
	}

	#[must_use]
	pub fn entity(&self, entity_id: EntityId) -> Option<&ClientEntity> {
		self.entities.get(&entity_id)
	}

	pub fn apply_chunk_create(&mut self, create: &ChunkCreate) {
		let slot = create.chunk_id as usize;
		if slot >= self.chunks.len() {
			self.chunks.resize_with(slot + 1, || None);
		}

		self.chunks[slot] = Some(ClientChunk {
			chunk: Arc::new(Chunk::new(create.location, create.size, create.tile_size)),
		});
	}

	pub fn apply_chunk_destroy(&mut self, destroy: &ChunkDestroy) {
		if let Some(slot) = self.chunks.get_mut(destroy.chunk_id as usize) {
			*slot = None;
		}
	}

	pub fn apply_chunk_reset(&mut self, reset: &ChunkReset) -> Result<(), CodecError> {
		let Some(Some(client)) = self.chunks.get(reset.chunk_id as usize) else {
			return Ok(()); // Unknown id: the chunk was destroyed while the reset was in flight
		};

		codec::deserialize_chunk(&client.chunk, &self.block_library, &reset.content)
	}

	pub fn apply_chunk_update(&mut self, update: &ChunkUpdate) {
		let Some(Some(client)) = self.chunks.get(update.chunk_id as usize) else {
			return;
		};

		for entry in &update.updates {
			client.chunk.update_block(entry.location.indices(), entry.new_block);
		}
	}

	pub fn apply_entities_creation(&mut self, creation: &EntitiesCreation) {
		for data in &creation.entities {
			let controlled_by = data.player_controlled.as_ref().map(|controlled| controlled.controlling_player);

			if controlled_by.is_some() && controlled_by == self.own_player_index {
				self.controlled_entity = Some(data.entity_id);
			}

			self.entities.insert(
				data.entity_id,
				ClientEntity {
					position: data.initial_state.position,
					rotation: data.initial_state.rotation,
					controlled_by,
				},
			);
		}
	}

	pub fn apply_entities_delete(&mut self, delete: &EntitiesDelete) {
		for entity_id in &delete.entities {
			self.entities.remove(entity_id);

			if self.controlled_entity == Some(*entity_id) {
				self.controlled_entity = None;
			}
		}
	}

	/// Applies observed entity states. The controlled entity is handled by the caller through
	/// reconciliation, so it is skipped here.
	pub fn apply_entities_state_update(&mut self, update: &EntitiesStateUpdate) {
		for data in &update.entities {
			if self.controlled_entity == Some(data.entity_id) {
				continue;
			}

			if let Some(entity) = self.entities.get_mut(&data.entity_id) {
				entity.position = data.state.position;
				entity.rotation = data.state.rotation;
			}
		}
	}

	pub fn set_controlled_transform(&mut self, position: Vector3<f32>, rotation: UnitQuaternion<f32>) {
		let Some(entity_id) = self.controlled_entity else { return };

		if let Some(entity) = self.entities.get_mut(&entity_id) {
			entity.position = position;
			entity.rotation = rotation;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lodestone_shared::protocol::{BlockUpdateEntry, VoxelLocation};

	fn world() -> ClientWorld {
		ClientWorld::new(Arc::new(BlockLibrary::with_default_blocks()))
	}

	fn create(chunk_id: u16) -> ChunkCreate {
		ChunkCreate {
			tick_index: 0,
			chunk_id,
			location: Vector3::new(0, 0, 0),
			size: Vector3::new(8, 8, 8),
			tile_size: 1.0,
		}
	}

	#[test]
	fn create_reset_update_destroy_lifecycle() {
		let mut world = world();
		let library = BlockLibrary::with_default_blocks();

		world.apply_chunk_create(&create(3));
		assert_eq!(world.chunk_count(), 1);

		// Full content from the server
		let source = Chunk::new(Vector3::new(0, 0, 0), Vector3::new(8, 8, 8), 1.0);
		source.update_block(Vector3::new(1, 1, 1), library.index_of("stone"));

		let mut content = vec![];
		codec::serialize_chunk(&source.read(), &library, &mut content);
		world
			.apply_chunk_reset(&ChunkReset { tick_index: 0, chunk_id: 3, content })
			.expect("reset must apply");

		let chunk = world.chunk(3).expect("chunk 3 must exist");
		assert_eq!(chunk.get_block(Vector3::new(1, 1, 1)), library.index_of("stone"));

		// Incremental update on top
		world.apply_chunk_update(&ChunkUpdate {
			tick_index: 1,
			chunk_id: 3,
			updates: vec![BlockUpdateEntry {
				location: VoxelLocation { x: 2, y: 0, z: 0 },
				new_block: library.index_of("dirt"),
			}],
		});

		let chunk = world.chunk(3).expect("chunk 3 must exist");
		assert_eq!(chunk.get_block(Vector3::new(2, 0, 0)), library.index_of("dirt"));

		world.apply_chunk_destroy(&ChunkDestroy { tick_index: 2, chunk_id: 3 });
		assert!(world.chunk(3).is_none());
	}

	#[test]
	fn reset_for_a_destroyed_chunk_is_ignored() {
		let mut world = world();
		assert!(world
			.apply_chunk_reset(&ChunkReset { tick_index: 0, chunk_id: 9, content: vec![] })
			.is_ok());
	}
}
