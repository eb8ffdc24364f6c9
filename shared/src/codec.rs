//! Palette encoding of chunk contents, shared by the on-disk chunk files and the `ChunkReset`
//! wire payload.
//!
//! Format v1, little-endian:
//!
//! ```text
//! u32  binary version (= 1)
//! u32  size x, u32 size y, u32 size z
//! u16  palette size k
//! k ×  { u16 name length, UTF-8 name }
//! if k > 8: (x·y·z) × u16 local ids, else (x·y·z) × u8 local ids
//! ```
//!
//! The palette holds only the block kinds actually present, in block index order, so a mostly
//! uniform chunk costs one byte per cell before compression.

use crate::blocks::{BlockIndex, BlockLibrary};
use crate::chunk::{Chunk, ChunkCells};
use crate::constants::{CHUNK_BINARY_VERSION, PACKET_LENGTH_LIMIT};
use bytes::{Buf, BufMut};
use nalgebra::Vector3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("unsupported chunk binary version {0}")]
	UnsupportedVersion(u32),

	#[error("chunk size mismatch, file has {found:?} but chunk is {expected:?}")]
	SizeMismatch {
		expected: Vector3<u32>,
		found: Vector3<u32>,
	},

	#[error("unknown block {0:?}")]
	UnknownBlock(String),

	#[error("palette id {0} out of range")]
	PaletteOutOfRange(u16),

	#[error("unexpected end of data")]
	Truncated,

	#[error("block name is not valid UTF-8")]
	InvalidString,

	#[error("corrupt compressed payload")]
	Decompression,

	#[error("payload larger than the {0} byte limit")]
	Oversized(usize),
}

/// Serializes a locked chunk snapshot into `out`.
pub fn serialize_chunk(cells: &ChunkCells, block_library: &BlockLibrary, out: &mut Vec<u8>) {
	let size = cells.size();

	out.put_u32_le(CHUNK_BINARY_VERSION);
	out.put_u32_le(size.x);
	out.put_u32_le(size.y);
	out.put_u32_le(size.z);

	let type_counts = cells.block_type_count();
	let mut palette_ids = vec![0u16; type_counts.len()];
	let mut palette_len = 0u16;

	for (block, count) in type_counts.iter().enumerate() {
		if *count == 0 {
			continue;
		}

		palette_ids[block] = palette_len;
		palette_len += 1;
	}

	out.put_u16_le(palette_len);
	for (block, count) in type_counts.iter().enumerate() {
		if *count == 0 {
			continue;
		}

		let name = &block_library.block(block as BlockIndex).name;
		out.put_u16_le(name.len() as u16);
		out.put_slice(name.as_bytes());
	}

	// The palette length decides how wide each cell is on disk
	if palette_len > 8 {
		for block in cells.blocks() {
			out.put_u16_le(palette_ids[*block as usize]);
		}
	} else {
		for block in cells.blocks() {
			out.put_u8(palette_ids[*block as usize] as u8);
		}
	}
}

/// Replaces a chunk's contents from serialized data.
///
/// The chunk is only touched once the whole payload has validated, so any error leaves it
/// unchanged. Emits the chunk's reset signal on success.
pub fn deserialize_chunk(chunk: &Chunk, block_library: &BlockLibrary, mut data: &[u8]) -> Result<(), CodecError> {
	let version = read_u32(&mut data)?;
	if version != CHUNK_BINARY_VERSION {
		return Err(CodecError::UnsupportedVersion(version));
	}

	let size = Vector3::new(read_u32(&mut data)?, read_u32(&mut data)?, read_u32(&mut data)?);
	if size != chunk.size() {
		return Err(CodecError::SizeMismatch { expected: chunk.size(), found: size });
	}

	let palette_len = read_u16(&mut data)?;
	let mut palette = Vec::with_capacity(palette_len as usize);

	for _ in 0..palette_len {
		let name_len = read_u16(&mut data)? as usize;
		if data.remaining() < name_len {
			return Err(CodecError::Truncated);
		}

		let name = std::str::from_utf8(&data[..name_len]).map_err(|_| CodecError::InvalidString)?;
		let block = block_library.index_of(name);
		if block == crate::blocks::INVALID_BLOCK {
			return Err(CodecError::UnknownBlock(name.to_owned()));
		}

		palette.push(block);
		data.advance(name_len);
	}

	let mut blocks = vec![0 as BlockIndex; chunk.block_count()];
	for block in &mut blocks {
		let local_id = if palette_len > 8 { read_u16(&mut data)? } else { read_u8(&mut data)? as u16 };

		*block = *palette
			.get(local_id as usize)
			.ok_or(CodecError::PaletteOutOfRange(local_id))?;
	}

	let mut cells = chunk.write();
	cells.blocks_mut().copy_from_slice(&blocks);
	cells.rebuild_derived_state();
	chunk.emit_reset();

	Ok(())
}

/// LZ4 wrapper used for chunk payloads at protocol versions that negotiate compression.
#[must_use]
pub fn compress_chunk_payload(raw: &[u8]) -> Vec<u8> {
	lz4_flex::block::compress_prepend_size(raw)
}

pub fn decompress_chunk_payload(compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
	if compressed.len() < 4 {
		return Err(CodecError::Truncated);
	}

	// The uncompressed size prefix is attacker controlled, bound it before allocating
	let uncompressed_len = u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]) as usize;
	if uncompressed_len > PACKET_LENGTH_LIMIT {
		return Err(CodecError::Oversized(PACKET_LENGTH_LIMIT));
	}

	lz4_flex::block::decompress_size_prepended(compressed).map_err(|_| CodecError::Decompression)
}

fn read_u8(data: &mut &[u8]) -> Result<u8, CodecError> {
	if data.remaining() < 1 {
		return Err(CodecError::Truncated);
	}
	Ok(data.get_u8())
}

fn read_u16(data: &mut &[u8]) -> Result<u16, CodecError> {
	if data.remaining() < 2 {
		return Err(CodecError::Truncated);
	}
	Ok(data.get_u16_le())
}

fn read_u32(data: &mut &[u8]) -> Result<u32, CodecError> {
	if data.remaining() < 4 {
		return Err(CodecError::Truncated);
	}
	Ok(data.get_u32_le())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blocks::EMPTY_BLOCK;
	use crate::constants::CHUNK_SIZE;

	fn chunk_32() -> Chunk {
		Chunk::new(Vector3::new(0, 0, 0), Vector3::new(CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE), 1.0)
	}

	fn read_palette(data: &[u8]) -> Vec<String> {
		let mut data = &data[16..];
		let palette_len = read_u16(&mut data).expect("palette length");

		(0..palette_len)
			.map(|_| {
				let len = read_u16(&mut data).expect("name length") as usize;
				let name = String::from_utf8(data[..len].to_vec()).expect("utf-8 name");
				data.advance(len);
				name
			})
			.collect()
	}

	#[test]
	fn sparse_chunk_file_round_trips() {
		let library = BlockLibrary::with_default_blocks();
		let chunk = chunk_32();

		chunk.update_block(Vector3::new(0, 0, 0), library.index_of("dirt"));
		chunk.update_block(Vector3::new(1, 0, 0), library.index_of("grass"));
		chunk.update_block(Vector3::new(0, 0, 1), library.index_of("stone"));

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &library, &mut data);

		// Palette holds exactly the kinds present, in block index order
		assert_eq!(read_palette(&data), ["empty", "dirt", "grass", "stone"]);

		let restored = chunk_32();
		deserialize_chunk(&restored, &library, &data).expect("deserialization must succeed");

		let expected = chunk.read();
		let actual = restored.read();
		assert_eq!(expected.blocks(), actual.blocks());
		assert_eq!(actual.block_type_count()[EMPTY_BLOCK as usize], (CHUNK_SIZE.pow(3) - 3) as u16);
		assert_eq!(actual.block_type_count()[library.index_of("dirt") as usize], 1);
		assert_eq!(actual.block_type_count()[library.index_of("grass") as usize], 1);
		assert_eq!(actual.block_type_count()[library.index_of("stone") as usize], 1);

		let mask = actual.collision_cell_mask();
		assert_eq!(mask.iter().filter(|set| *set).count(), 3);
		assert!(mask[actual.local_index(Vector3::new(0, 0, 0))]);
		assert!(mask[actual.local_index(Vector3::new(1, 0, 0))]);
		assert!(mask[actual.local_index(Vector3::new(0, 0, 1))]);
	}

	#[test]
	fn palette_is_minimal() {
		let library = BlockLibrary::with_default_blocks();
		let chunk = chunk_32();

		chunk.update_block(Vector3::new(4, 4, 4), library.index_of("stone"));
		chunk.update_block(Vector3::new(4, 4, 5), library.index_of("stone"));

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &library, &mut data);

		assert_eq!(read_palette(&data).len(), 2);
	}

	#[test]
	fn wide_palette_switches_to_u16_cells() {
		let mut library = BlockLibrary::with_default_blocks();
		for extra in 0..4 {
			library.register(crate::blocks::BlockData {
				name: format!("extra_{extra}").into(),
				face_textures: [0; 6],
				has_collisions: true,
				permeability: 0.0,
			});
		}

		let chunk = chunk_32();
		for block in 1u8..=9 {
			chunk.update_block(Vector3::new(block as u32, 0, 0), block);
		}

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &library, &mut data);

		let restored = chunk_32();
		deserialize_chunk(&restored, &library, &data).expect("deserialization must succeed");
		assert_eq!(chunk.read().blocks(), restored.read().blocks());
	}

	#[test]
	fn bad_version_leaves_chunk_unchanged() {
		let library = BlockLibrary::with_default_blocks();
		let chunk = chunk_32();
		chunk.update_block(Vector3::new(0, 0, 0), library.index_of("dirt"));

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &library, &mut data);
		data[0] = 9;

		let restored = chunk_32();
		restored.update_block(Vector3::new(7, 7, 7), library.index_of("stone"));

		assert!(matches!(
			deserialize_chunk(&restored, &library, &data),
			Err(CodecError::UnsupportedVersion(_))
		));
		assert_eq!(restored.get_block(Vector3::new(7, 7, 7)), library.index_of("stone"));
		assert_eq!(restored.get_block(Vector3::new(0, 0, 0)), EMPTY_BLOCK);
	}

	#[test]
	fn unknown_block_name_is_rejected() {
		let library = BlockLibrary::with_default_blocks();
		let mut extended = BlockLibrary::with_default_blocks();
		let custom = extended.register(crate::blocks::BlockData {
			name: Box::from("unobtainium"),
			face_textures: [0; 6],
			has_collisions: true,
			permeability: 0.0,
		});

		let chunk = chunk_32();
		chunk.update_block(Vector3::new(0, 0, 0), custom);

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &extended, &mut data);

		let restored = chunk_32();
		assert!(matches!(
			deserialize_chunk(&restored, &library, &data),
			Err(CodecError::UnknownBlock(_))
		));
		assert!(restored.read().blocks().iter().all(|block| *block == EMPTY_BLOCK));
	}

	#[test]
	fn size_mismatch_is_rejected() {
		let library = BlockLibrary::with_default_blocks();
		let chunk = chunk_32();

		let mut data = vec![];
		serialize_chunk(&chunk.read(), &library, &mut data);

		let smaller = Chunk::new(Vector3::new(0, 0, 0), Vector3::new(16, 16, 16), 1.0);
		assert!(matches!(
			deserialize_chunk(&smaller, &library, &data),
			Err(CodecError::SizeMismatch { .. })
		));
	}

	#[test]
	fn compression_round_trips() {
		let payload: Vec<u8> = (0..4096).map(|value| (value % 11) as u8).collect();

		let compressed = compress_chunk_payload(&payload);
		assert!(compressed.len() < payload.len());
		assert_eq!(decompress_chunk_payload(&compressed).expect("decompression must succeed"), payload);
	}
}
