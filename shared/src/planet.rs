use crate::blocks::{BlockIndex, BlockLibrary, Direction, EMPTY_BLOCK};
use crate::constants::CHUNK_SIZE;
use crate::container::{BlockIndices, ChunkContainer};
use crate::chunk::ChunkIndices;
use nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::ops::{Deref, DerefMut};

/// A chunk container with a gravity well shaped like a rounded box.
///
/// Terrain is generated deterministically from a seed, so the server can regenerate the same
/// planet and overlay whatever chunk files were saved on top of it.
pub struct Planet {
	container: ChunkContainer,

	grid_size: Vector3<u32>,
	corner_radius: f32,
	gravity: f32,
}

impl Planet {
	#[must_use]
	pub fn new(grid_size: Vector3<u32>, tile_size: f32, corner_radius: f32, gravity: f32) -> Self {
		assert!(grid_size.x % CHUNK_SIZE == 0 && grid_size.y % CHUNK_SIZE == 0 && grid_size.z % CHUNK_SIZE == 0);

		Self {
			container: ChunkContainer::new(Vector3::new(CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE), tile_size),
			grid_size,
			corner_radius,
			gravity,
		}
	}

	#[must_use]
	pub const fn gravity(&self) -> f32 {
		self.gravity
	}

	/// Chunk indices covered by the planet grid, min inclusive, max exclusive.
	#[must_use]
	pub fn chunk_range(&self) -> (ChunkIndices, ChunkIndices) {
		let count = (self.grid_size / CHUNK_SIZE).cast::<i32>();
		let first = -count / 2;
		(first, first + count)
	}

	/// World-space center of the gravity well.
	#[must_use]
	pub fn center(&self) -> Vector3<f32> {
		let (first, last) = self.chunk_range();
		let extent = self.container.chunk_extent();
		(first.cast::<f32>() + last.cast::<f32>()).component_mul(&extent) * 0.5
	}

	/// Half extent of the terrain box along each axis, in world units.
	#[must_use]
	pub fn half_extent(&self) -> Vector3<f32> {
		self.grid_size.cast::<f32>() * self.container.tile_size() * 0.5
	}

	/// Gradient of the rounded-box signed distance field, pointing away from the surface.
	///
	/// The position is clamped onto a box shrunk by the corner radius; the direction from that
	/// inner point is the SDF gradient, which rounds off edges and corners.
	#[must_use]
	pub fn compute_up_direction(&self, position: Vector3<f32>) -> Vector3<f32> {
		let center = self.center();
		let offset = position - center;

		let dist_to_center = offset.x.abs().max(offset.y.abs()).max(offset.z.abs());
		let inner_size = (dist_to_center - self.corner_radius.max(1.0)).max(0.0);

		let inner = Vector3::new(
			offset.x.clamp(-inner_size, inner_size),
			offset.y.clamp(-inner_size, inner_size),
			offset.z.clamp(-inner_size, inner_size),
		);

		let direction = offset - inner;
		if direction.norm_squared() < 1.0e-6 {
			return Vector3::z();
		}

		direction.normalize()
	}

	/// Gravity strength at a position. Full strength inside the well, linear falloff out to twice
	/// the surface distance.
	#[must_use]
	pub fn gravity_factor(&self, position: Vector3<f32>) -> f32 {
		let offset = position - self.center();
		let distance = offset.x.abs().max(offset.y.abs()).max(offset.z.abs());

		let half = self.half_extent().x.max(self.half_extent().y).max(self.half_extent().z);
		let falloff = ((distance - half) / half).max(0.0);

		self.gravity * (1.0 - falloff).max(0.0)
	}

	/// Creates every chunk of the grid and fills in the layered shell terrain.
	pub fn generate_chunks(&mut self, block_library: &BlockLibrary, seed: u64) {
		const FREE_SPACE: u32 = 30;

		let snow = block_library.index_of("snow");
		let dirt = block_library.index_of("dirt");
		let stone = block_library.index_of("stone");
		let stone_mossy = block_library.index_of("stone_mossy");

		let (first, last) = self.chunk_range();
		let grid_size = self.grid_size;
		let mut rng = StdRng::seed_from_u64(seed);

		for cz in first.z..last.z {
			for cy in first.y..last.y {
				for cx in first.x..last.x {
					let indices = Vector3::new(cx, cy, cz);
					let chunk = self.container.add_chunk(indices);
					let grid_min = (indices - first).map(|v| v as u32) * CHUNK_SIZE;

					chunk.reset(|blocks| {
						let mut linear = 0;
						for z in 0..CHUNK_SIZE {
							for y in 0..CHUNK_SIZE {
								for x in 0..CHUNK_SIZE {
									let grid = grid_min + Vector3::new(x, y, z);

									let depth = grid
										.x
										.min(grid.y)
										.min(grid.z)
										.min(grid_size.x - grid.x - 1)
										.min(grid_size.y - grid.y - 1)
										.min(grid_size.z - grid.z - 1);

									blocks[linear] = if depth < FREE_SPACE / 2 {
										EMPTY_BLOCK
									} else {
										match depth - FREE_SPACE / 2 {
											0 | 1 => snow,
											2..=12 => dirt,
											_ => {
												if rng.gen_bool(0.9) {
													stone
												} else {
													stone_mossy
												}
											}
										}
									};

									linear += 1;
								}
							}
						}
					});
				}
			}
		}
	}

	/// Builds a flat landing platform facing `up_direction`: a planks slab with a stone brick rim
	/// and a few blocks of cleared space above it.
	pub fn generate_platform(&self, block_library: &BlockLibrary, up_direction: Direction, center: BlockIndices) {
		const HALF_SIZE: i64 = 5;
		const CLEARANCE: i64 = 4;

		let planks = block_library.index_of("planks");
		let stone_bricks = block_library.index_of("stone_bricks");

		let normal = up_direction.normal().map(|v| v.round() as i64);
		let tangent_u = if normal.x == 0 {
			Vector3::new(1, 0, 0)
		} else {
			Vector3::new(0, 1, 0)
		};
		let tangent_v = normal.cross(&tangent_u);

		for du in -HALF_SIZE..=HALF_SIZE {
			for dv in -HALF_SIZE..=HALF_SIZE {
				let surface = center + tangent_u * du + tangent_v * dv;

				let rim = du.abs() == HALF_SIZE || dv.abs() == HALF_SIZE;
				self.set_block(surface, if rim { stone_bricks } else { planks });

				for height in 1..=CLEARANCE {
					self.set_block(surface + normal * height, EMPTY_BLOCK);
				}
			}
		}
	}

	/// Writes a block by global block indices; positions outside any chunk are ignored.
	pub fn set_block(&self, block_indices: BlockIndices, block: BlockIndex) {
		let (chunk_indices, local) = self.container.chunk_indices_by_block_indices(block_indices);

		if let Some(chunk) = self.container.chunk(chunk_indices) {
			chunk.update_block(local, block);
		}
	}

	/// Reads a block by global block indices.
	#[must_use]
	pub fn get_block(&self, block_indices: BlockIndices) -> Option<BlockIndex> {
		let (chunk_indices, local) = self.container.chunk_indices_by_block_indices(block_indices);
		self.container.chunk(chunk_indices).map(|chunk| chunk.get_block(local))
	}
}

impl Deref for Planet {
	type Target = ChunkContainer;

	fn deref(&self) -> &Self::Target {
		&self.container
	}
}

impl DerefMut for Planet {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.container
	}
}
