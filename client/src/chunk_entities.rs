//! The render half of the chunk entity bridge: one mesh per known chunk, regenerated at most
//! once per tick no matter how many block edits arrived. A renderer uploads [`ChunkMesh`]es as it
//! sees fit; without one the meshes still track the world, which is what the tests exercise.

use crate::world::ClientWorld;
use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::chunk::{Chunk, VertexSink};
use lodestone_shared::protocol::ChunkId;
use lodestone_shared::signal::SlotId;
use nalgebra::Vector3;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct ChunkMesh {
	pub positions: Vec<Vector3<f32>>,
	pub normals: Vec<Vector3<f32>>,
	/// `(u, v, texture slice)` per vertex.
	pub uvs: Vec<Vector3<f32>>,
	pub indices: Vec<u32>,
}

impl ChunkMesh {
	#[must_use]
	pub fn quad_count(&self) -> usize {
		self.indices.len() / 6
	}
}

impl VertexSink for ChunkMesh {
	fn push_quad(&mut self, positions: [Vector3<f32>; 4], normal: Vector3<f32>, uvs: [Vector3<f32>; 4]) {
		let first = self.positions.len() as u32;

		self.positions.extend_from_slice(&positions);
		self.normals.extend_from_slice(&[normal; 4]);
		self.uvs.extend_from_slice(&uvs);

		self.indices
			.extend_from_slice(&[first, first + 2, first + 1, first + 1, first + 2, first + 3]);
	}
}

struct TrackedChunk {
	chunk: Arc<Chunk>,
	update_slot: SlotId,
	reset_slot: SlotId,
}

pub struct ClientChunkEntities {
	block_library: Arc<BlockLibrary>,

	tracked: FxHashMap<ChunkId, TrackedChunk>,
	meshes: FxHashMap<ChunkId, ChunkMesh>,
	dirty: Arc<Mutex<FxHashSet<ChunkId>>>,
}

impl ClientChunkEntities {
	#[must_use]
	pub fn new(block_library: Arc<BlockLibrary>) -> Self {
		Self {
			block_library,
			tracked: FxHashMap::default(),
			meshes: FxHashMap::default(),
			dirty: Arc::new(Mutex::new(FxHashSet::default())),
		}
	}

	#[must_use]
	pub fn mesh(&self, chunk_id: ChunkId) -> Option<&ChunkMesh> {
		self.meshes.get(&chunk_id)
	}

	#[must_use]
	pub fn mesh_count(&self) -> usize {
		self.meshes.len()
	}

	/// Once per tick: pick up appeared/vanished chunks, then remesh everything that changed.
	pub fn update(&mut self, world: &ClientWorld) {
		self.sync_tracked(world);

		let dirty: Vec<ChunkId> = self.dirty.lock().drain().collect();
		for chunk_id in dirty {
			let Some(tracked) = self.tracked.get(&chunk_id) else { continue };

			let mut mesh = ChunkMesh::default();

			// The gravity center decides the UV up-face; in chunk-local space it sits opposite
			// the chunk's own offset from the world origin
			let chunk = &tracked.chunk;
			let extent = chunk.size().cast::<f32>() * chunk.block_size();
			let center_hint = -(chunk.indices().cast::<f32>() + Vector3::new(0.5, 0.5, 0.5)).component_mul(&extent);

			chunk.build_mesh(&self.block_library, center_hint, &mut mesh);
			self.meshes.insert(chunk_id, mesh);
		}
	}

	fn sync_tracked(&mut self, world: &ClientWorld) {
		// Chunks that disappeared take their mesh and subscriptions with them
		let vanished: Vec<ChunkId> = self
			.tracked
			.iter()
			.filter(|(chunk_id, tracked)| {
				world
					.chunk(**chunk_id)
					.map_or(true, |chunk| !Arc::ptr_eq(chunk, &tracked.chunk))
			})
			.map(|(chunk_id, _)| *chunk_id)
			.collect();

		for chunk_id in vanished {
			if let Some(tracked) = self.tracked.remove(&chunk_id) {
				tracked.chunk.on_block_updated.disconnect(tracked.update_slot);
				tracked.chunk.on_reset.disconnect(tracked.reset_slot);
			}
			self.meshes.remove(&chunk_id);
			self.dirty.lock().remove(&chunk_id);
		}

		for (chunk_id, chunk) in world.chunks() {
			if self.tracked.contains_key(&chunk_id) {
				continue;
			}

			let dirty = self.dirty.clone();
			let update_slot = chunk.on_block_updated.connect(move |_| {
				dirty.lock().insert(chunk_id);
			});

			let dirty = self.dirty.clone();
			let reset_slot = chunk.on_reset.connect(move |()| {
				dirty.lock().insert(chunk_id);
			});

			self.dirty.lock().insert(chunk_id);
			self.tracked.insert(
				chunk_id,
				TrackedChunk {
					chunk: chunk.clone(),
					update_slot,
					reset_slot,
				},
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lodestone_shared::codec;
	use lodestone_shared::protocol::{ChunkCreate, ChunkDestroy, ChunkReset};

	fn world_with_chunk() -> (ClientWorld, Arc<BlockLibrary>) {
		let library = Arc::new(BlockLibrary::with_default_blocks());
		let mut world = ClientWorld::new(library.clone());

		world.apply_chunk_create(&ChunkCreate {
			tick_index: 0,
			chunk_id: 0,
			location: Vector3::new(0, 0, 0),
			size: Vector3::new(8, 8, 8),
			tile_size: 1.0,
		});

		(world, library)
	}

	#[test]
	fn lone_block_meshes_six_faces() {
		let (mut world, library) = world_with_chunk();
		let mut entities = ClientChunkEntities::new(library.clone());

		let source = Chunk::new(Vector3::new(0, 0, 0), Vector3::new(8, 8, 8), 1.0);
		source.update_block(Vector3::new(3, 3, 3), library.index_of("stone"));

		let mut content = vec![];
		codec::serialize_chunk(&source.read(), &library, &mut content);
		world
			.apply_chunk_reset(&ChunkReset { tick_index: 0, chunk_id: 0, content })
			.expect("reset must apply");

		entities.update(&world);

		let mesh = entities.mesh(0).expect("the chunk must have a mesh");
		assert_eq!(mesh.quad_count(), 6);
		assert_eq!(mesh.positions.len(), 24);
		assert_eq!(mesh.normals.len(), 24);
		assert_eq!(mesh.uvs.len(), 24);
	}

	#[test]
	fn touching_blocks_cull_their_shared_face() {
		let (mut world, library) = world_with_chunk();
		let mut entities = ClientChunkEntities::new(library.clone());

		entities.update(&world);

		let chunk = world.chunk(0).expect("chunk must exist").clone();
		chunk.update_block(Vector3::new(3, 3, 3), library.index_of("stone"));
		chunk.update_block(Vector3::new(4, 3, 3), library.index_of("stone"));

		entities.update(&world);

		// Two cubes sharing one face: 12 faces minus the 2 hidden ones
		let mesh = entities.mesh(0).expect("the chunk must have a mesh");
		assert_eq!(mesh.quad_count(), 10);

		world.apply_chunk_destroy(&ChunkDestroy { tick_index: 1, chunk_id: 0 });
		entities.update(&world);
		assert_eq!(entities.mesh_count(), 0);
	}

	#[test]
	fn many_edits_remesh_once() {
		let (mut world, library) = world_with_chunk();
		let mut entities = ClientChunkEntities::new(library.clone());
		entities.update(&world);

		let chunk = world.chunk(0).expect("chunk must exist").clone();
		for x in 0..8 {
			chunk.update_block(Vector3::new(x, 0, 0), library.index_of("dirt"));
		}

		// All eight edits collapse into a single dirty entry
		assert_eq!(entities.dirty.lock().len(), 1);
		entities.update(&world);
		assert!(entities.dirty.lock().is_empty());
	}
}
