//! Keeps one physics body per chunk and swaps its collider when the chunk's content changes.
//!
//! Block edits only mark the chunk dirty; the actual greedy box packing runs at most once per
//! chunk per tick, on the task scheduler, against a read-locked snapshot. Results are rejoined on
//! the main thread before the physics step so the new colliders take part in the same tick.

use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::chunk::{Chunk, ChunkIndices, ColliderBox};
use lodestone_shared::physics::{AutoCleanup, Physics, TaskScheduler};
use lodestone_shared::planet::Planet;
use nalgebra::Isometry3;
use parking_lot::Mutex;
use rapier3d::dynamics::{RigidBodyBuilder, RigidBodyHandle};
use rapier3d::geometry::{ColliderBuilder, ColliderHandle, SharedShape};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

struct ChunkBody {
	body: AutoCleanup<RigidBodyHandle>,
	collider: Option<AutoCleanup<ColliderHandle>>,
}

pub struct ChunkEntities {
	bodies: FxHashMap<ChunkIndices, ChunkBody>,
	dirty: Arc<Mutex<FxHashSet<ChunkIndices>>>,
}

impl ChunkEntities {
	/// Creates a fixed body per chunk and builds the initial colliders.
	#[must_use]
	pub fn new(physics: &mut Physics, planet: &Planet, block_library: &Arc<BlockLibrary>, scheduler: &TaskScheduler) -> Self {
		let dirty = Arc::new(Mutex::new(FxHashSet::default()));

		// Every chunk starts dirty so the first update pass builds all colliders
		{
			let mut dirty = dirty.lock();
			for chunk in planet.chunks() {
				dirty.insert(chunk.indices());
			}
		}

		let slot_dirty = dirty.clone();
		planet.on_chunk_updated.connect(move |indices: &ChunkIndices| {
			slot_dirty.lock().insert(*indices);
		});

		let mut bodies = FxHashMap::default();
		for chunk in planet.chunks() {
			let offset = planet.chunk_offset(chunk.indices());
			let body = physics.insert_rigid_body(RigidBodyBuilder::fixed().translation(offset));

			bodies.insert(chunk.indices(), ChunkBody { body, collider: None });
		}

		let mut chunk_entities = Self { bodies, dirty };
		chunk_entities.update(physics, planet, block_library, scheduler);
		chunk_entities
	}

	/// Rebuilds colliders for every chunk touched since the last call, one rebuild per chunk no
	/// matter how many blocks changed.
	pub fn update(&mut self, physics: &mut Physics, planet: &Planet, block_library: &Arc<BlockLibrary>, scheduler: &TaskScheduler) {
		let dirty: Vec<ChunkIndices> = self.dirty.lock().drain().collect();
		if dirty.is_empty() {
			return;
		}

		let results: Arc<Mutex<Vec<(ChunkIndices, Option<Vec<ColliderBox>>)>>> =
			Arc::new(Mutex::new(Vec::with_capacity(dirty.len())));

		for indices in dirty {
			let Some(chunk) = planet.chunk(indices) else { continue };

			let chunk: Arc<Chunk> = chunk.clone();
			let results = results.clone();
			let library = block_library.clone();

			scheduler.spawn(move || {
				let boxes = chunk.build_collider(&library);
				results.lock().push((chunk.indices(), boxes));
			});
		}

		scheduler.wait_all();

		let results = std::mem::take(&mut *results.lock());
		for (indices, boxes) in results {
			let Some(chunk_body) = self.bodies.get_mut(&indices) else { continue };

			// Dropping the old handle queues its removal inside Physics
			chunk_body.collider = None;

			if let Some(boxes) = boxes {
				let shapes: Vec<_> = boxes
					.into_iter()
					.map(|collider_box| {
						(
							Isometry3::translation(collider_box.center.x, collider_box.center.y, collider_box.center.z),
							SharedShape::cuboid(collider_box.size.x * 0.5, collider_box.size.y * 0.5, collider_box.size.z * 0.5),
						)
					})
					.collect();

				chunk_body.collider = Some(physics.insert_rigid_body_collider(
					*chunk_body.body,
					ColliderBuilder::new(SharedShape::compound(shapes)),
				));
			}
		}
	}

	#[must_use]
	pub fn body_count(&self) -> usize {
		self.bodies.len()
	}
}
