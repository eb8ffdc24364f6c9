//! Minimal entity store.
//!
//! The simulation only needs per-entity pose plus a couple of flags, so this is a generational
//! slab rather than a full ECS: handles stay cheap to copy and hash, and a stale handle can never
//! reach an unrelated entity that reused the slot.

use nalgebra::{UnitQuaternion, Vector3};

pub type PlayerIndex = u16;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntityHandle {
	index: u32,
	generation: u32,
}

#[derive(Clone, Debug)]
pub struct EntityRecord {
	pub position: Vector3<f32>,
	pub rotation: UnitQuaternion<f32>,

	/// Whether peers should receive continuous state updates for this entity.
	pub is_moving: bool,

	pub controlled_by: Option<PlayerIndex>,
}

struct Slot {
	generation: u32,
	record: Option<EntityRecord>,
}

pub struct Entities {
	slots: Vec<Slot>,
	free: Vec<u32>,
}

impl Entities {
	#[must_use]
	pub fn new() -> Self {
		Self { slots: vec![], free: vec![] }
	}

	pub fn spawn(&mut self, record: EntityRecord) -> EntityHandle {
		match self.free.pop() {
			Some(index) => {
				let slot = &mut self.slots[index as usize];
				slot.record = Some(record);
				EntityHandle { index, generation: slot.generation }
			}
			None => {
				self.slots.push(Slot { generation: 0, record: Some(record) });
				EntityHandle {
					index: self.slots.len() as u32 - 1,
					generation: 0,
				}
			}
		}
	}

	pub fn despawn(&mut self, handle: EntityHandle) {
		let Some(slot) = self.slots.get_mut(handle.index as usize) else { return };

		if slot.generation == handle.generation && slot.record.is_some() {
			slot.record = None;
			slot.generation += 1;
			self.free.push(handle.index);
		}
	}

	#[must_use]
	pub fn get(&self, handle: EntityHandle) -> Option<&EntityRecord> {
		let slot = self.slots.get(handle.index as usize)?;
		if slot.generation != handle.generation {
			return None;
		}
		slot.record.as_ref()
	}

	#[must_use]
	pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut EntityRecord> {
		let slot = self.slots.get_mut(handle.index as usize)?;
		if slot.generation != handle.generation {
			return None;
		}
		slot.record.as_mut()
	}

	pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &EntityRecord)> {
		self.slots.iter().enumerate().filter_map(|(index, slot)| {
			slot.record.as_ref().map(|record| {
				(
					EntityHandle {
						index: index as u32,
						generation: slot.generation,
					},
					record,
				)
			})
		})
	}
}

impl Default for Entities {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record() -> EntityRecord {
		EntityRecord {
			position: Vector3::zeros(),
			rotation: UnitQuaternion::identity(),
			is_moving: false,
			controlled_by: None,
		}
	}

	#[test]
	fn stale_handles_miss_after_slot_reuse() {
		let mut entities = Entities::new();

		let first = entities.spawn(record());
		entities.despawn(first);
		let second = entities.spawn(record());

		assert!(entities.get(first).is_none());
		assert!(entities.get(second).is_some());
	}

	#[test]
	fn despawning_twice_is_harmless() {
		let mut entities = Entities::new();

		let handle = entities.spawn(record());
		entities.despawn(handle);
		entities.despawn(handle);

		assert_eq!(entities.iter().count(), 0);
	}
}
