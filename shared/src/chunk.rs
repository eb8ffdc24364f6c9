use crate::blocks::{BlockIndex, BlockLibrary, Direction, EMPTY_BLOCK};
use crate::signal::Signal;
use bit_vec::BitVec;
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Signed 3D key of a chunk within its container.
pub type ChunkIndices = Vector3<i32>;

/// Position of a block within its chunk.
pub type LocalBlockIndices = Vector3<u32>;

#[derive(Clone, Copy, Debug)]
pub struct BlockUpdate {
	pub indices: LocalBlockIndices,
	pub new_block: BlockIndex,
}

/// Axis-aligned box produced by the greedy collider packer, in chunk-local space (chunk center at
/// the origin).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColliderBox {
	pub center: Vector3<f32>,
	pub size: Vector3<f32>,
}

/// Receives the quads emitted by [`Chunk::build_mesh`].
///
/// Corners arrive in an order such that the triangles `(0, 2, 1)` and `(1, 2, 3)` wind
/// counter-clockwise when viewed from the solid side. `uvs` are `(u, v, texture slice)`.
pub trait VertexSink {
	fn push_quad(&mut self, positions: [Vector3<f32>; 4], normal: Vector3<f32>, uvs: [Vector3<f32>; 4]);
}

/// Fixed-size dense block volume.
///
/// All cell state lives behind a readers-writer lock; the update and reset signals fire while the
/// write lock is held, so subscribers must not call back into the chunk.
pub struct Chunk {
	indices: ChunkIndices,
	size: Vector3<u32>,
	block_size: f32,

	cells: RwLock<ChunkCells>,

	pub on_block_updated: Signal<BlockUpdate>,
	pub on_reset: Signal<()>,
}

/// The lock-guarded contents of a [`Chunk`].
pub struct ChunkCells {
	size: Vector3<u32>,
	blocks: Box<[BlockIndex]>,
	block_type_count: Vec<u16>,
	collision_cell_mask: BitVec,
}

impl Chunk {
	#[must_use]
	pub fn new(indices: ChunkIndices, size: Vector3<u32>, block_size: f32) -> Self {
		let block_count = (size.x * size.y * size.z) as usize;

		Self {
			indices,
			size,
			block_size,
			cells: RwLock::new(ChunkCells {
				size,
				blocks: vec![EMPTY_BLOCK; block_count].into_boxed_slice(),
				block_type_count: vec![block_count as u16],
				collision_cell_mask: BitVec::from_elem(block_count, false),
			}),
			on_block_updated: Signal::new(),
			on_reset: Signal::new(),
		}
	}

	#[must_use]
	pub const fn indices(&self) -> ChunkIndices {
		self.indices
	}

	#[must_use]
	pub const fn size(&self) -> Vector3<u32> {
		self.size
	}

	#[must_use]
	pub const fn block_size(&self) -> f32 {
		self.block_size
	}

	#[must_use]
	pub fn block_count(&self) -> usize {
		(self.size.x * self.size.y * self.size.z) as usize
	}

	/// Chunk-local center of the given cell. The chunk itself is centered on the origin.
	#[must_use]
	pub fn block_center(&self, indices: LocalBlockIndices) -> Vector3<f32> {
		(indices.cast::<f32>() + Vector3::new(0.5, 0.5, 0.5) - self.size.cast::<f32>() * 0.5) * self.block_size
	}

	pub fn read(&self) -> RwLockReadGuard<ChunkCells> {
		self.cells.read()
	}

	#[must_use]
	pub fn get_block(&self, indices: LocalBlockIndices) -> BlockIndex {
		self.cells.read().get_block(indices)
	}

	/// Writes one cell, keeping the collision mask and per-kind counts in sync.
	///
	/// Writing the value already present still emits `on_block_updated`; observers rely on the
	/// echo to re-synchronize clients.
	pub fn update_block(&self, indices: LocalBlockIndices, new_block: BlockIndex) {
		let mut cells = self.cells.write();

		let linear = cells.local_index(indices);
		let previous = cells.blocks[linear];

		cells.block_type_count[previous as usize] -= 1;
		cells.blocks[linear] = new_block;
		cells.grow_type_counts(new_block);
		cells.block_type_count[new_block as usize] += 1;
		cells.collision_cell_mask.set(linear, new_block != EMPTY_BLOCK);

		self.on_block_updated.emit(&BlockUpdate { indices, new_block });
	}

	/// Bulk-replaces the whole volume through `fill` and recomputes the derived state.
	pub fn reset(&self, fill: impl FnOnce(&mut [BlockIndex])) {
		let mut cells = self.cells.write();

		fill(&mut cells.blocks);
		cells.rebuild_derived_state();

		self.on_reset.emit(&());
	}

	/// Write access for callers that must validate new content before committing it, such as
	/// deserialization. [`Chunk::emit_reset`] has to be called manually after a bulk write.
	pub(crate) fn write(&self) -> RwLockWriteGuard<ChunkCells> {
		self.cells.write()
	}

	pub(crate) fn emit_reset(&self) {
		self.on_reset.emit(&());
	}

	/// Packs solid cells into as few axis-aligned boxes as possible.
	///
	/// Runs along +X are grown first, then extended along +Y while every covered row stays solid,
	/// then along +Z. Consumed cells are cleared from a scratch copy of the collision mask so each
	/// cell ends up in exactly one box. An empty chunk yields no collider.
	#[must_use]
	pub fn build_collider(&self, _block_library: &BlockLibrary) -> Option<Vec<ColliderBox>> {
		let cells = self.cells.read();
		let size = self.size;

		let mut remaining = cells.collision_cell_mask.clone();
		let mut boxes = vec![];

		let index_of = |x: u32, y: u32, z: u32| ((z * size.y + y) * size.x + x) as usize;

		for z in 0..size.z {
			for y in 0..size.y {
				let mut x = 0;
				while x < size.x {
					if !remaining[index_of(x, y, z)] {
						x += 1;
						continue;
					}

					// Run along +X
					let start_x = x;
					while x < size.x && remaining[index_of(x, y, z)] {
						x += 1;
					}
					let end_x = x - 1;

					// Grow along +Y while the whole row stays solid
					let mut end_y = y;
					'grow_y: while end_y + 1 < size.y {
						for check_x in start_x..=end_x {
							if !remaining[index_of(check_x, end_y + 1, z)] {
								break 'grow_y;
							}
						}
						end_y += 1;
					}

					// Then along +Z
					let mut end_z = z;
					'grow_z: while end_z + 1 < size.z {
						for check_y in y..=end_y {
							for check_x in start_x..=end_x {
								if !remaining[index_of(check_x, check_y, end_z + 1)] {
									break 'grow_z;
								}
							}
						}
						end_z += 1;
					}

					for mark_z in z..=end_z {
						for mark_y in y..=end_y {
							for mark_x in start_x..=end_x {
								remaining.set(index_of(mark_x, mark_y, mark_z), false);
							}
						}
					}

					let min = Vector3::new(start_x, y, z).cast::<f32>();
					let max = Vector3::new(end_x + 1, end_y + 1, end_z + 1).cast::<f32>();
					let box_size = (max - min) * self.block_size;

					boxes.push(ColliderBox {
						center: min * self.block_size + box_size * 0.5 - size.cast::<f32>() * self.block_size * 0.5,
						size: box_size,
					});
				}
			}
		}

		match boxes.is_empty() {
			true => None,
			false => Some(boxes),
		}
	}

	/// Emits one quad per solid face whose neighbor is empty or outside the chunk.
	///
	/// `center_hint` points at the gravity center and decides which face counts as "up" for the
	/// cubemap-style UV projection.
	pub fn build_mesh(&self, block_library: &BlockLibrary, center_hint: Vector3<f32>, sink: &mut dyn VertexSink) {
		let cells = self.cells.read();
		let size = self.size;

		let mut draw_face = |block: BlockIndex, block_center: Vector3<f32>, corners: [Vector3<f32>; 4]| {
			let face_center = (corners[0] + corners[1] + corners[2] + corners[3]) / 4.0;
			let face_normal = (face_center - block_center).normalize();

			// Rotate the face frame so the gravity-facing side becomes canonical up, then project
			// corner directions on the face axis pair, the same way a cubemap lookup would.
			let face_up = Direction::from_normal((face_center - center_hint).normalize()).normal();
			let up_rotation = UnitQuaternion::rotation_between(&face_up, &Vector3::z())
				.unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::PI));

			let texture_direction = Direction::from_normal(up_rotation * face_normal);
			let slice = block_library.block(block).face_textures[texture_direction.index()] as f32;

			let mut uvs = [Vector3::zeros(); 4];
			for (uv, corner) in uvs.iter_mut().zip(&corners) {
				let dir = up_rotation * (corner - block_center);
				let dir_abs = dir.abs();

				let (magnitude, uv2) = match texture_direction {
					Direction::Back | Direction::Front => {
						(0.5 / dir_abs.x, Vector2::new(if dir.x < 0.0 { -dir.z } else { dir.z }, -dir.y))
					}
					Direction::Down | Direction::Up => {
						(0.5 / dir_abs.y, Vector2::new(dir.x, if dir.y < 0.0 { -dir.z } else { dir.z }))
					}
					Direction::Left | Direction::Right => {
						(0.5 / dir_abs.z, Vector2::new(if dir.z < 0.0 { dir.x } else { -dir.x }, -dir.y))
					}
				};

				let uv2 = uv2 * magnitude + Vector2::new(0.5, 0.5);
				*uv = Vector3::new(uv2.x, uv2.y, slice);
			}

			sink.push_quad(corners, face_normal, uvs);
		};

		for z in 0..size.z {
			for y in 0..size.y {
				for x in 0..size.x {
					let indices = Vector3::new(x, y, z);
					let block = cells.get_block(indices);
					if block == EMPTY_BLOCK {
						continue;
					}

					let corner = |dx: u32, dy: u32, dz: u32| self.block_corner(indices, Vector3::new(dx, dy, dz));
					let block_center = self.block_center(indices);

					let neighbor_empty = |offset: Vector3<i32>| {
						cells
							.neighbor_block(indices, offset)
							.map_or(true, |neighbor| neighbor == EMPTY_BLOCK)
					};

					// Up (+Z)
					if neighbor_empty(Vector3::new(0, 0, 1)) {
						draw_face(block, block_center, [corner(0, 1, 1), corner(1, 1, 1), corner(0, 0, 1), corner(1, 0, 1)]);
					}
					// Down (-Z)
					if neighbor_empty(Vector3::new(0, 0, -1)) {
						draw_face(block, block_center, [corner(1, 1, 0), corner(0, 1, 0), corner(1, 0, 0), corner(0, 0, 0)]);
					}
					// Front (-Y)
					if neighbor_empty(Vector3::new(0, -1, 0)) {
						draw_face(block, block_center, [corner(1, 0, 1), corner(0, 0, 1), corner(1, 0, 0), corner(0, 0, 0)]);
					}
					// Back (+Y)
					if neighbor_empty(Vector3::new(0, 1, 0)) {
						draw_face(block, block_center, [corner(0, 1, 1), corner(1, 1, 1), corner(0, 1, 0), corner(1, 1, 0)]);
					}
					// Left (-X)
					if neighbor_empty(Vector3::new(-1, 0, 0)) {
						draw_face(block, block_center, [corner(0, 1, 1), corner(0, 0, 1), corner(0, 1, 0), corner(0, 0, 0)]);
					}
					// Right (+X)
					if neighbor_empty(Vector3::new(1, 0, 0)) {
						draw_face(block, block_center, [corner(1, 0, 1), corner(1, 1, 1), corner(1, 0, 0), corner(1, 1, 0)]);
					}
				}
			}
		}
	}

	fn block_corner(&self, indices: LocalBlockIndices, corner: Vector3<u32>) -> Vector3<f32> {
		((indices + corner).cast::<f32>() - self.size.cast::<f32>() * 0.5) * self.block_size
	}
}

impl ChunkCells {
	#[must_use]
	pub const fn size(&self) -> Vector3<u32> {
		self.size
	}

	#[must_use]
	pub fn local_index(&self, indices: LocalBlockIndices) -> usize {
		debug_assert!(indices.x < self.size.x && indices.y < self.size.y && indices.z < self.size.z);
		((indices.z * self.size.y + indices.y) * self.size.x + indices.x) as usize
	}

	#[must_use]
	pub fn local_indices(&self, linear: usize) -> LocalBlockIndices {
		let linear = linear as u32;
		let x = linear % self.size.x;
		let y = (linear / self.size.x) % self.size.y;
		let z = linear / (self.size.x * self.size.y);
		Vector3::new(x, y, z)
	}

	#[must_use]
	pub fn get_block(&self, indices: LocalBlockIndices) -> BlockIndex {
		self.blocks[self.local_index(indices)]
	}

	#[must_use]
	pub fn get_block_linear(&self, linear: usize) -> BlockIndex {
		self.blocks[linear]
	}

	#[must_use]
	pub fn neighbor_block(&self, indices: LocalBlockIndices, offset: Vector3<i32>) -> Option<BlockIndex> {
		let neighbor = indices.cast::<i32>() + offset;

		if neighbor.x < 0
			|| neighbor.y < 0
			|| neighbor.z < 0
			|| neighbor.x >= self.size.x as i32
			|| neighbor.y >= self.size.y as i32
			|| neighbor.z >= self.size.z as i32
		{
			return None;
		}

		Some(self.get_block(neighbor.map(|v| v as u32)))
	}

	#[must_use]
	pub fn blocks(&self) -> &[BlockIndex] {
		&self.blocks
	}

	#[must_use]
	pub fn block_type_count(&self) -> &[u16] {
		&self.block_type_count
	}

	#[must_use]
	pub fn collision_cell_mask(&self) -> &BitVec {
		&self.collision_cell_mask
	}

	pub(crate) fn blocks_mut(&mut self) -> &mut [BlockIndex] {
		&mut self.blocks
	}

	pub(crate) fn rebuild_derived_state(&mut self) {
		self.block_type_count.clear();

		for (linear, block) in self.blocks.iter().enumerate() {
			self.collision_cell_mask.set(linear, *block != EMPTY_BLOCK);

			if *block as usize >= self.block_type_count.len() {
				self.block_type_count.resize(*block as usize + 1, 0);
			}
			self.block_type_count[*block as usize] += 1;
		}
	}

	fn grow_type_counts(&mut self, block: BlockIndex) {
		if block as usize >= self.block_type_count.len() {
			self.block_type_count.resize(block as usize + 1, 0);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
	use std::sync::Arc;

	fn test_chunk() -> Chunk {
		Chunk::new(Vector3::new(0, 0, 0), Vector3::new(8, 8, 8), 1.0)
	}

	#[test]
	fn collision_mask_tracks_non_empty_cells() {
		let chunk = test_chunk();

		chunk.update_block(Vector3::new(1, 2, 3), 4);
		chunk.update_block(Vector3::new(0, 0, 0), 2);
		chunk.update_block(Vector3::new(1, 2, 3), EMPTY_BLOCK);

		let cells = chunk.read();
		for linear in 0..chunk.block_count() {
			let expected = cells.get_block_linear(linear) != EMPTY_BLOCK;
			assert_eq!(cells.collision_cell_mask()[linear], expected);
		}

		assert!(cells.collision_cell_mask()[cells.local_index(Vector3::new(0, 0, 0))]);
		assert!(!cells.collision_cell_mask()[cells.local_index(Vector3::new(1, 2, 3))]);
	}

	#[test]
	fn block_type_counts_sum_to_volume() {
		let chunk = test_chunk();

		chunk.update_block(Vector3::new(1, 0, 0), 2);
		chunk.update_block(Vector3::new(2, 0, 0), 2);
		chunk.update_block(Vector3::new(3, 0, 0), 3);

		let cells = chunk.read();
		let total: u32 = cells.block_type_count().iter().map(|count| *count as u32).sum();
		assert_eq!(total, chunk.block_count() as u32);
		assert_eq!(cells.block_type_count()[2], 2);
		assert_eq!(cells.block_type_count()[3], 1);
	}

	#[test]
	fn rewriting_same_value_still_notifies() {
		let chunk = test_chunk();
		let updates = Arc::new(AtomicUsize::new(0));

		let slot_updates = updates.clone();
		chunk.on_block_updated.connect(move |_| {
			slot_updates.fetch_add(1, Relaxed);
		});

		chunk.update_block(Vector3::new(0, 0, 0), 2);
		chunk.update_block(Vector3::new(0, 0, 0), 2);

		assert_eq!(updates.load(Relaxed), 2);
	}

	#[test]
	fn reset_recomputes_counts_and_mask() {
		let chunk = test_chunk();

		chunk.reset(|blocks| {
			blocks.fill(5);
			blocks[0] = EMPTY_BLOCK;
		});

		let cells = chunk.read();
		assert_eq!(cells.block_type_count()[EMPTY_BLOCK as usize], 1);
		assert_eq!(cells.block_type_count()[5], chunk.block_count() as u16 - 1);
		assert!(!cells.collision_cell_mask()[0]);
		assert!(cells.collision_cell_mask()[1]);
	}

	#[test]
	fn empty_chunk_builds_no_collider() {
		let chunk = test_chunk();
		assert!(chunk.build_collider(&BlockLibrary::with_default_blocks()).is_none());
	}

	#[test]
	fn full_chunk_packs_into_one_box() {
		let chunk = test_chunk();
		chunk.reset(|blocks| blocks.fill(4));

		let boxes = chunk
			.build_collider(&BlockLibrary::with_default_blocks())
			.expect("full chunk must produce a collider");

		assert_eq!(boxes.len(), 1);
		assert_eq!(boxes[0].size, Vector3::new(8.0, 8.0, 8.0));
		assert_eq!(boxes[0].center, Vector3::new(0.0, 0.0, 0.0));
	}

	#[test]
	fn packer_consumes_each_cell_once() {
		let chunk = test_chunk();

		// An L shape: one 2x1x1 run and one cell above its origin
		chunk.update_block(Vector3::new(0, 0, 0), 4);
		chunk.update_block(Vector3::new(1, 0, 0), 4);
		chunk.update_block(Vector3::new(0, 1, 0), 4);

		let boxes = chunk
			.build_collider(&BlockLibrary::with_default_blocks())
			.expect("solid cells must produce a collider");

		let covered: f32 = boxes.iter().map(|b| b.size.x * b.size.y * b.size.z).sum();
		assert_eq!(covered, 3.0);
	}
}
