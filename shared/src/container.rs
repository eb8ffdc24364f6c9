use crate::chunk::{Chunk, ChunkIndices, LocalBlockIndices};
use crate::signal::Signal;
use nalgebra::Vector3;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Signed world-space block coordinates, spanning every chunk of a container.
pub type BlockIndices = Vector3<i64>;

/// Owns chunks keyed by their signed 3D indices and converts between world, chunk and block
/// coordinates.
///
/// Chunks are identified by `(cx, cy, cz) ∈ ℤ³`; chunk `(0, 0, 0)` spans the world-space box
/// `[0, extent)³` where `extent = chunk_size · tile_size`. Adding an already present chunk or
/// removing a missing one is a programmer error and panics.
pub struct ChunkContainer {
	tile_size: f32,
	chunk_size: Vector3<u32>,
	chunks: FxHashMap<ChunkIndices, Arc<Chunk>>,

	pub on_chunk_added: Arc<Signal<ChunkIndices>>,
	pub on_chunk_remove: Arc<Signal<ChunkIndices>>,
	pub on_chunk_updated: Arc<Signal<ChunkIndices>>,
}

impl ChunkContainer {
	#[must_use]
	pub fn new(chunk_size: Vector3<u32>, tile_size: f32) -> Self {
		Self {
			tile_size,
			chunk_size,
			chunks: FxHashMap::default(),
			on_chunk_added: Arc::new(Signal::new()),
			on_chunk_remove: Arc::new(Signal::new()),
			on_chunk_updated: Arc::new(Signal::new()),
		}
	}

	#[must_use]
	pub const fn tile_size(&self) -> f32 {
		self.tile_size
	}

	#[must_use]
	pub const fn chunk_size(&self) -> Vector3<u32> {
		self.chunk_size
	}

	pub fn add_chunk(&mut self, indices: ChunkIndices) -> Arc<Chunk> {
		assert!(!self.chunks.contains_key(&indices), "chunk {indices:?} added twice");

		let chunk = Arc::new(Chunk::new(indices, self.chunk_size, self.tile_size));

		// Forward both cell-level signals as a single chunk-level update notification
		let updated = self.on_chunk_updated.clone();
		chunk.on_block_updated.connect(move |_| updated.emit(&indices));
		let updated = self.on_chunk_updated.clone();
		chunk.on_reset.connect(move |()| updated.emit(&indices));

		self.chunks.insert(indices, chunk.clone());
		self.on_chunk_added.emit(&indices);

		chunk
	}

	pub fn remove_chunk(&mut self, indices: ChunkIndices) {
		assert!(self.chunks.contains_key(&indices), "chunk {indices:?} is not present");

		self.on_chunk_remove.emit(&indices);
		self.chunks.remove(&indices);
	}

	#[must_use]
	pub fn chunk(&self, indices: ChunkIndices) -> Option<&Arc<Chunk>> {
		self.chunks.get(&indices)
	}

	pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
		self.chunks.values()
	}

	#[must_use]
	pub fn chunk_count(&self) -> usize {
		self.chunks.len()
	}

	/// World-space extent of one chunk along each axis.
	#[must_use]
	pub fn chunk_extent(&self) -> Vector3<f32> {
		self.chunk_size.cast::<f32>() * self.tile_size
	}

	/// World-space position of a chunk's center.
	#[must_use]
	pub fn chunk_offset(&self, indices: ChunkIndices) -> Vector3<f32> {
		(indices.cast::<f32>() + Vector3::new(0.5, 0.5, 0.5)).component_mul(&self.chunk_extent())
	}

	/// Chunk containing the given world position.
	#[must_use]
	pub fn chunk_indices_by_position(&self, position: Vector3<f32>) -> ChunkIndices {
		let extent = self.chunk_extent();
		Vector3::new(
			(position.x / extent.x).floor() as i32,
			(position.y / extent.y).floor() as i32,
			(position.z / extent.z).floor() as i32,
		)
	}

	/// Global block coordinates of a cell.
	#[must_use]
	pub fn block_indices(&self, chunk_indices: ChunkIndices, local_indices: LocalBlockIndices) -> BlockIndices {
		let size = self.chunk_size.cast::<i64>();
		chunk_indices.cast::<i64>().component_mul(&size) + local_indices.cast::<i64>()
	}

	/// Inverse of [`ChunkContainer::block_indices`].
	#[must_use]
	pub fn chunk_indices_by_block_indices(&self, block_indices: BlockIndices) -> (ChunkIndices, LocalBlockIndices) {
		let size = self.chunk_size.cast::<i64>();

		let chunk = Vector3::new(
			block_indices.x.div_euclid(size.x),
			block_indices.y.div_euclid(size.y),
			block_indices.z.div_euclid(size.z),
		);
		let local = Vector3::new(
			block_indices.x.rem_euclid(size.x),
			block_indices.y.rem_euclid(size.y),
			block_indices.z.rem_euclid(size.z),
		);

		(chunk.map(|v| v as i32), local.map(|v| v as u32))
	}

	/// World-space center of a block.
	#[must_use]
	pub fn block_position(&self, chunk_indices: ChunkIndices, local_indices: LocalBlockIndices) -> Vector3<f32> {
		let chunk_min = chunk_indices.cast::<f32>().component_mul(&self.chunk_extent());
		chunk_min + (local_indices.cast::<f32>() + Vector3::new(0.5, 0.5, 0.5)) * self.tile_size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn container() -> ChunkContainer {
		ChunkContainer::new(Vector3::new(32, 32, 32), 1.0)
	}

	#[test]
	fn block_coordinates_round_trip() {
		let container = container();

		for &chunk_indices in &[
			Vector3::new(0, 0, 0),
			Vector3::new(-1, 2, -3),
			Vector3::new(17, -17, 4),
		] {
			for &local in &[
				Vector3::new(0u32, 0, 0),
				Vector3::new(31, 31, 31),
				Vector3::new(5, 0, 19),
			] {
				let block = container.block_indices(chunk_indices, local);
				assert_eq!(container.chunk_indices_by_block_indices(block), (chunk_indices, local));
			}
		}
	}

	#[test]
	fn position_maps_back_to_owning_chunk() {
		let container = container();

		let position = container.block_position(Vector3::new(-2, 0, 1), Vector3::new(4, 16, 31));
		assert_eq!(container.chunk_indices_by_position(position), Vector3::new(-2, 0, 1));
	}

	#[test]
	#[should_panic(expected = "added twice")]
	fn duplicate_chunk_insertion_is_fatal() {
		let mut container = container();
		container.add_chunk(Vector3::new(0, 0, 0));
		container.add_chunk(Vector3::new(0, 0, 0));
	}

	#[test]
	fn chunk_updates_are_forwarded() {
		use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
		use std::sync::Arc as StdArc;

		let mut container = container();
		let chunk = container.add_chunk(Vector3::new(1, 0, 0));

		let updates = StdArc::new(AtomicUsize::new(0));
		let slot_updates = updates.clone();
		container.on_chunk_updated.connect(move |indices: &ChunkIndices| {
			assert_eq!(*indices, Vector3::new(1, 0, 0));
			slot_updates.fetch_add(1, Relaxed);
		});

		chunk.update_block(Vector3::new(0, 0, 0), 3);
		chunk.reset(|blocks| blocks.fill(0));

		assert_eq!(updates.load(Relaxed), 2);
	}
}
