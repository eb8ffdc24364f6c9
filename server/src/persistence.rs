//! On-disk chunk storage: one file per chunk, named by its signed indices, holding the palette
//! encoding from [`lodestone_shared::codec`].

use lodestone_shared::blocks::BlockLibrary;
use lodestone_shared::chunk::ChunkIndices;
use lodestone_shared::codec;
use lodestone_shared::planet::Planet;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::{fs, io};

#[must_use]
pub fn chunk_file_name(indices: ChunkIndices) -> String {
	format!("{:+}_{:+}_{:+}.chunk", indices.x, indices.y, indices.z)
}

#[must_use]
pub fn chunk_file_path(directory: &Path, indices: ChunkIndices) -> PathBuf {
	directory.join(chunk_file_name(indices))
}

pub fn save_chunk(directory: &Path, planet: &Planet, block_library: &BlockLibrary, indices: ChunkIndices) -> io::Result<()> {
	let Some(chunk) = planet.chunk(indices) else {
		return Ok(());
	};

	let mut data = vec![];
	codec::serialize_chunk(&chunk.read(), block_library, &mut data);

	fs::create_dir_all(directory)?;
	fs::write(chunk_file_path(directory, indices), data)
}

/// Overlays saved chunk files onto freshly generated chunks. A missing file is normal (the chunk
/// was never edited); a broken one is logged and the generated content stays.
pub fn load_chunks(directory: &Path, planet: &Planet, block_library: &BlockLibrary) {
	if !directory.is_dir() {
		info!("save directory {} doesn't exist, not loading chunks", directory.display());
		return;
	}

	let mut loaded = 0usize;

	for chunk in planet.chunks() {
		let path = chunk_file_path(directory, chunk.indices());

		let data = match fs::read(&path) {
			Ok(data) => data,
			Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
			Err(error) => {
				warn!("failed to read chunk file {}: {error}", path.display());
				continue;
			}
		};

		match codec::deserialize_chunk(chunk, block_library, &data) {
			Ok(()) => loaded += 1,
			Err(error) => error!("failed to load chunk {:?}: {error}", chunk.indices()),
		}
	}

	if loaded > 0 {
		info!("loaded {loaded} chunks from {}", directory.display());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nalgebra::Vector3;
	use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

	static TEST_DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

	fn scratch_directory() -> PathBuf {
		let unique = TEST_DIR_COUNTER.fetch_add(1, Relaxed);
		std::env::temp_dir().join(format!("lodestone-persistence-{}-{unique}", std::process::id()))
	}

	#[test]
	fn file_names_carry_explicit_signs() {
		assert_eq!(chunk_file_name(Vector3::new(0, -1, 2)), "+0_-1_+2.chunk");
		assert_eq!(chunk_file_name(Vector3::new(-12, 7, -3)), "-12_+7_-3.chunk");
	}

	#[test]
	fn saved_chunks_survive_a_reload() {
		let directory = scratch_directory();
		let library = BlockLibrary::with_default_blocks();

		let mut planet = Planet::new(Vector3::new(64, 64, 64), 1.0, 16.0, 9.81);
		planet.generate_chunks(&library, 3);

		let indices = Vector3::new(0, 0, 0);
		let edited = Vector3::new(5, 6, 7);
		let stone = library.index_of("stone_bricks");

		planet.chunk(indices).expect("chunk must exist").update_block(edited, stone);
		save_chunk(&directory, &planet, &library, indices).expect("saving must succeed");

		let mut restored = Planet::new(Vector3::new(64, 64, 64), 1.0, 16.0, 9.81);
		restored.generate_chunks(&library, 3);
		load_chunks(&directory, &restored, &library);

		assert_eq!(restored.chunk(indices).expect("chunk must exist").get_block(edited), stone);

		let _ = fs::remove_dir_all(&directory);
	}

	#[test]
	fn corrupt_files_leave_the_generated_chunk() {
		let directory = scratch_directory();
		let library = BlockLibrary::with_default_blocks();

		let mut planet = Planet::new(Vector3::new(64, 64, 64), 1.0, 16.0, 9.81);
		planet.generate_chunks(&library, 3);

		let indices = Vector3::new(0, 0, 0);
		let expected = planet.chunk(indices).expect("chunk must exist").read().blocks().to_vec();

		fs::create_dir_all(&directory).expect("scratch dir");
		fs::write(chunk_file_path(&directory, indices), [0xFF, 0x00, 0x01]).expect("write corrupt file");

		load_chunks(&directory, &planet, &library);
		assert_eq!(planet.chunk(indices).expect("chunk must exist").read().blocks(), &expected[..]);

		let _ = fs::remove_dir_all(&directory);
	}
}
