//! Session-scoped string table.
//!
//! Strings that would otherwise be repeated across packets (block names, entity class names) are
//! registered once on the server and pushed to clients as [`NetworkStrings`] right after
//! authentication; later packets can refer to them by id. Id 0 is always the empty string.

use crate::protocol::packets::NetworkStrings;
use rustc_hash::FxHashMap;

pub struct NetworkStringStore {
	strings: Vec<Box<str>>,
	indices: FxHashMap<Box<str>, u32>,
}

impl NetworkStringStore {
	#[must_use]
	pub fn new() -> Self {
		let mut store = Self {
			strings: vec![],
			indices: FxHashMap::default(),
		};
		store.register("");
		store
	}

	pub fn register(&mut self, string: &str) -> u32 {
		if let Some(id) = self.indices.get(string) {
			return *id;
		}

		let id = self.strings.len() as u32;
		self.strings.push(Box::from(string));
		self.indices.insert(Box::from(string), id);
		id
	}

	#[must_use]
	pub fn get(&self, id: u32) -> Option<&str> {
		self.strings.get(id as usize).map(|string| &**string)
	}

	#[must_use]
	pub fn id_of(&self, string: &str) -> Option<u32> {
		self.indices.get(string).copied()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.strings.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.strings.is_empty()
	}

	/// Packet filling a peer's store from scratch.
	#[must_use]
	pub fn to_packet(&self) -> NetworkStrings {
		NetworkStrings {
			start_id: 0,
			strings: self.strings.iter().map(|string| string.to_string()).collect(),
		}
	}

	/// Applies a received [`NetworkStrings`] packet, overwriting from `start_id` on.
	pub fn apply(&mut self, packet: &NetworkStrings) {
		self.strings.truncate(packet.start_id as usize);
		self.indices.retain(|_, id| *id < packet.start_id);

		for string in &packet.strings {
			let id = self.strings.len() as u32;
			self.strings.push(Box::from(&**string));
			self.indices.insert(Box::from(&**string), id);
		}
	}
}

impl Default for NetworkStringStore {
	fn default() -> Self {
		Self::new()
	}
}
