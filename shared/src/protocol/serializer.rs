//! Little-endian packet (de)serialization primitives.
//!
//! Both sides tag their serializer with the protocol version negotiated during authentication;
//! packets branch on it to conditionally (de)serialize fields added in later versions. Array
//! lengths travel as 7-bit continuation varints, signed values as zig-zag varints, strings as
//! length-prefixed UTF-8 where the prefix width is chosen from the compile-time maximum length.

use bytes::{Buf, BufMut};
use nalgebra::{Quaternion, Unit, UnitQuaternion, Vector3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("unknown opcode {0}")]
	UnknownOpcode(u8),

	#[error("unexpected end of packet")]
	Truncated,

	#[error("varint does not fit in 64 bits")]
	VarintOverflow,

	#[error("string of {length} bytes exceeds the {max} byte bound")]
	StringTooLong { length: usize, max: usize },

	#[error("string is not valid UTF-8")]
	InvalidUtf8,

	#[error("field holds an invalid value")]
	InvalidValue,

	#[error(transparent)]
	Codec(#[from] crate::codec::CodecError),
}

pub struct PacketWriter {
	buffer: Vec<u8>,
	protocol_version: u32,
}

impl PacketWriter {
	#[must_use]
	pub fn new(protocol_version: u32) -> Self {
		Self { buffer: vec![], protocol_version }
	}

	#[must_use]
	pub const fn protocol_version(&self) -> u32 {
		self.protocol_version
	}

	#[must_use]
	pub fn into_inner(self) -> Vec<u8> {
		self.buffer
	}

	pub fn put_u8(&mut self, value: u8) {
		self.buffer.put_u8(value);
	}

	pub fn put_bool(&mut self, value: bool) {
		self.buffer.put_u8(value as u8);
	}

	pub fn put_u16(&mut self, value: u16) {
		self.buffer.put_u16_le(value);
	}

	pub fn put_u32(&mut self, value: u32) {
		self.buffer.put_u32_le(value);
	}

	pub fn put_f32(&mut self, value: f32) {
		self.buffer.put_f32_le(value);
	}

	pub fn put_varint(&mut self, mut value: u64) {
		loop {
			let mut byte = (value & 0x7F) as u8;
			value >>= 7;
			if value != 0 {
				byte |= 0x80;
			}
			self.buffer.put_u8(byte);
			if value == 0 {
				break;
			}
		}
	}

	pub fn put_varint_signed(&mut self, value: i64) {
		self.put_varint(((value << 1) ^ (value >> 63)) as u64);
	}

	pub fn put_string<const MAX: usize>(&mut self, value: &str) {
		debug_assert!(value.len() <= MAX, "string exceeds its compile-time bound");

		if MAX < 1 << 8 {
			self.buffer.put_u8(value.len() as u8);
		} else if MAX < 1 << 16 {
			self.buffer.put_u16_le(value.len() as u16);
		} else {
			self.buffer.put_u32_le(value.len() as u32);
		}

		self.buffer.put_slice(value.as_bytes());
	}

	pub fn put_bytes(&mut self, value: &[u8]) {
		self.put_varint(value.len() as u64);
		self.buffer.put_slice(value);
	}

	pub fn put_raw(&mut self, value: &[u8]) {
		self.buffer.put_slice(value);
	}

	pub fn put_vector3(&mut self, value: Vector3<f32>) {
		self.put_f32(value.x);
		self.put_f32(value.y);
		self.put_f32(value.z);
	}

	pub fn put_quaternion(&mut self, value: UnitQuaternion<f32>) {
		self.put_f32(value.i);
		self.put_f32(value.j);
		self.put_f32(value.k);
		self.put_f32(value.w);
	}
}

pub struct PacketReader<'a> {
	data: &'a [u8],
	protocol_version: u32,
}

impl<'a> PacketReader<'a> {
	#[must_use]
	pub fn new(data: &'a [u8], protocol_version: u32) -> Self {
		Self { data, protocol_version }
	}

	#[must_use]
	pub const fn protocol_version(&self) -> u32 {
		self.protocol_version
	}

	#[must_use]
	pub fn remaining(&self) -> usize {
		self.data.remaining()
	}

	pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
		if self.data.remaining() < 1 {
			return Err(ProtocolError::Truncated);
		}
		Ok(self.data.get_u8())
	}

	pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
		Ok(self.get_u8()? != 0)
	}

	pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
		if self.data.remaining() < 2 {
			return Err(ProtocolError::Truncated);
		}
		Ok(self.data.get_u16_le())
	}

	pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
		if self.data.remaining() < 4 {
			return Err(ProtocolError::Truncated);
		}
		Ok(self.data.get_u32_le())
	}

	pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
		if self.data.remaining() < 4 {
			return Err(ProtocolError::Truncated);
		}
		Ok(self.data.get_f32_le())
	}

	pub fn get_varint(&mut self) -> Result<u64, ProtocolError> {
		let mut value = 0u64;
		let mut shift = 0u32;

		loop {
			let byte = self.get_u8()?;
			value |= u64::from(byte & 0x7F) << shift;

			if byte & 0x80 == 0 {
				return Ok(value);
			}

			shift += 7;
			if shift >= 64 {
				return Err(ProtocolError::VarintOverflow);
			}
		}
	}

	pub fn get_varint_signed(&mut self) -> Result<i64, ProtocolError> {
		let raw = self.get_varint()?;
		Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
	}

	pub fn get_string<const MAX: usize>(&mut self) -> Result<String, ProtocolError> {
		let length = if MAX < 1 << 8 {
			self.get_u8()? as usize
		} else if MAX < 1 << 16 {
			self.get_u16()? as usize
		} else {
			self.get_u32()? as usize
		};

		if length > MAX {
			return Err(ProtocolError::StringTooLong { length, max: MAX });
		}
		if self.data.remaining() < length {
			return Err(ProtocolError::Truncated);
		}

		let value = std::str::from_utf8(&self.data[..length])
			.map_err(|_| ProtocolError::InvalidUtf8)?
			.to_owned();
		self.data.advance(length);
		Ok(value)
	}

	pub fn get_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
		let length = self.get_varint()? as usize;
		if self.data.remaining() < length {
			return Err(ProtocolError::Truncated);
		}

		let value = self.data[..length].to_vec();
		self.data.advance(length);
		Ok(value)
	}

	pub fn get_vector3(&mut self) -> Result<Vector3<f32>, ProtocolError> {
		Ok(Vector3::new(self.get_f32()?, self.get_f32()?, self.get_f32()?))
	}

	pub fn get_quaternion(&mut self) -> Result<UnitQuaternion<f32>, ProtocolError> {
		let i = self.get_f32()?;
		let j = self.get_f32()?;
		let k = self.get_f32()?;
		let w = self.get_f32()?;
		Ok(Unit::new_normalize(Quaternion::new(w, i, j, k)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn varint_layout_matches_the_wire_format() {
		let cases: [(u64, &[u8]); 5] = [
			(0, &[0x00]),
			(1, &[0x01]),
			(127, &[0x7F]),
			(128, &[0x80, 0x01]),
			(25565, &[0xDD, 0xC7, 0x01]),
		];

		for (value, expected) in cases {
			let mut writer = PacketWriter::new(0);
			writer.put_varint(value);
			assert_eq!(writer.into_inner(), expected, "encoding of {value}");
		}
	}

	#[test]
	fn signed_varints_round_trip() {
		for value in [0i64, -1, 1, -64, 64, i64::MIN, i64::MAX, -123_456_789] {
			let mut writer = PacketWriter::new(0);
			writer.put_varint_signed(value);

			let data = writer.into_inner();
			let mut reader = PacketReader::new(&data, 0);
			assert_eq!(reader.get_varint_signed().expect("read must succeed"), value);
		}
	}

	#[test]
	fn string_prefix_width_follows_the_bound() {
		let mut writer = PacketWriter::new(0);
		writer.put_string::<16>("hi");
		assert_eq!(writer.into_inner().len(), 1 + 2);

		let mut writer = PacketWriter::new(0);
		writer.put_string::<1024>("hi");
		assert_eq!(writer.into_inner().len(), 2 + 2);
	}

	#[test]
	fn oversized_strings_are_rejected_on_read() {
		let mut writer = PacketWriter::new(0);
		// Hand-craft a length prefix larger than the reader's bound
		writer.put_u8(200);

		let data = writer.into_inner();
		let mut reader = PacketReader::new(&data, 0);
		assert!(matches!(
			reader.get_string::<16>(),
			Err(ProtocolError::StringTooLong { length: 200, max: 16 })
		));
	}

	#[test]
	fn truncated_reads_fail_cleanly() {
		let mut reader = PacketReader::new(&[0x01, 0x02], 0);
		assert!(matches!(reader.get_u32(), Err(ProtocolError::Truncated)));
	}
}
