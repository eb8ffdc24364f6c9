use nalgebra::Vector3;
use rustc_hash::FxHashMap;

/// Palette index identifying a block kind. `0` is always the empty block, `255` is never a valid
/// registration and marks failed lookups.
pub type BlockIndex = u8;

pub const EMPTY_BLOCK: BlockIndex = 0;
pub const INVALID_BLOCK: BlockIndex = 255;

/// One of the six axis-aligned faces of a block, in the canonical frame where `Up` is +Z.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
	Back,
	Down,
	Front,
	Left,
	Right,
	Up,
}

pub const DIRECTIONS: [Direction; 6] = [
	Direction::Back,
	Direction::Down,
	Direction::Front,
	Direction::Left,
	Direction::Right,
	Direction::Up,
];

impl Direction {
	#[must_use]
	pub fn normal(self) -> Vector3<f32> {
		match self {
			Self::Back => Vector3::new(0.0, 1.0, 0.0),
			Self::Down => Vector3::new(0.0, 0.0, -1.0),
			Self::Front => Vector3::new(0.0, -1.0, 0.0),
			Self::Left => Vector3::new(-1.0, 0.0, 0.0),
			Self::Right => Vector3::new(1.0, 0.0, 0.0),
			Self::Up => Vector3::new(0.0, 0.0, 1.0),
		}
	}

	/// Picks the face whose normal is closest to `normal`.
	#[must_use]
	pub fn from_normal(normal: Vector3<f32>) -> Self {
		let mut best = Self::Up;
		let mut best_dot = f32::MIN;

		for direction in DIRECTIONS {
			let dot = direction.normal().dot(&normal);
			if dot > best_dot {
				best = direction;
				best_dot = dot;
			}
		}

		best
	}

	#[must_use]
	pub fn index(self) -> usize {
		match self {
			Self::Back => 0,
			Self::Down => 1,
			Self::Front => 2,
			Self::Left => 3,
			Self::Right => 4,
			Self::Up => 5,
		}
	}
}

pub struct BlockData {
	pub name: Box<str>,

	/// Texture slice used for each face, indexed by [`Direction::index`].
	pub face_textures: [u32; 6],

	pub has_collisions: bool,
	pub permeability: f32,
}

/// Registry of every block kind the game knows about. Indices are assigned in registration order
/// and are stable for the lifetime of the library, which makes them safe to persist through the
/// name palette of the chunk codec.
pub struct BlockLibrary {
	blocks: Vec<BlockData>,
	name_to_index: FxHashMap<Box<str>, BlockIndex>,
}

impl BlockLibrary {
	/// Creates a library containing only the empty block.
	#[must_use]
	pub fn new() -> Self {
		let mut library = Self {
			blocks: vec![],
			name_to_index: FxHashMap::default(),
		};

		library.register(BlockData {
			name: Box::from("empty"),
			face_textures: [0; 6],
			has_collisions: false,
			permeability: 1.0,
		});

		library
	}

	/// Creates the stock library used by both the server and the client.
	#[must_use]
	pub fn with_default_blocks() -> Self {
		let mut library = Self::new();

		let solid = |name: &str, texture: u32| BlockData {
			name: Box::from(name),
			face_textures: [texture; 6],
			has_collisions: true,
			permeability: 0.0,
		};

		library.register(solid("dirt", 2));
		library.register(BlockData {
			name: Box::from("grass"),
			// Grass caps the top, dirt underneath, blended sides
			face_textures: [1, 2, 1, 1, 1, 0],
			has_collisions: true,
			permeability: 0.0,
		});
		library.register(solid("snow", 3));
		library.register(solid("stone", 4));
		library.register(solid("stone_mossy", 5));
		library.register(solid("planks", 6));
		library.register(solid("stone_bricks", 7));
		library.register(BlockData {
			name: Box::from("glass"),
			face_textures: [8; 6],
			has_collisions: true,
			permeability: 0.9,
		});

		library
	}

	/// Registers a new block kind and returns its index.
	///
	/// Panics if the name is already registered or if the palette is exhausted, both of which are
	/// programmer errors in the block set definition.
	pub fn register(&mut self, block: BlockData) -> BlockIndex {
		assert!(
			!self.name_to_index.contains_key(&block.name),
			"block {:?} registered twice",
			block.name
		);
		assert!((self.blocks.len() as u8) < INVALID_BLOCK, "block palette exhausted");

		let index = self.blocks.len() as BlockIndex;
		self.name_to_index.insert(block.name.clone(), index);
		self.blocks.push(block);
		index
	}

	/// Exact name lookup, [`INVALID_BLOCK`] when unknown.
	#[must_use]
	pub fn index_of(&self, name: &str) -> BlockIndex {
		self.name_to_index.get(name).copied().unwrap_or(INVALID_BLOCK)
	}

	#[must_use]
	pub fn block(&self, index: BlockIndex) -> &BlockData {
		&self.blocks[index as usize]
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.blocks.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.blocks.iter().map(|block| &*block.name)
	}
}

impl Default for BlockLibrary {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registration_assigns_indices_in_insertion_order() {
		let library = BlockLibrary::with_default_blocks();

		assert_eq!(library.index_of("empty"), EMPTY_BLOCK);
		assert_eq!(library.index_of("dirt"), 1);
		assert_eq!(library.index_of("grass"), 2);
		assert_eq!(library.block(1).name.as_ref(), "dirt");
	}

	#[test]
	fn unknown_name_is_invalid() {
		let library = BlockLibrary::with_default_blocks();
		assert_eq!(library.index_of("bedrock"), INVALID_BLOCK);
	}

	#[test]
	fn empty_block_never_collides() {
		let library = BlockLibrary::with_default_blocks();
		assert!(!library.block(EMPTY_BLOCK).has_collisions);
	}
}
