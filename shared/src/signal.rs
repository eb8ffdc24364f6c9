//! Synchronous observer channels, the replacement for the intrusive signal / slot pattern the
//! engine is built around. Emission happens on the emitting thread, while any lock the emitter
//! holds is still held, so subscribers must never call back into the emitter.

use parking_lot::Mutex;

/// Token returned by [`Signal::connect`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotId(u64);

type Slot<T> = Box<dyn Fn(&T) + Send + Sync>;

pub struct Signal<T> {
	slots: Mutex<SlotList<T>>,
}

struct SlotList<T> {
	next_id: u64,
	slots: Vec<(u64, Slot<T>)>,
}

impl<T> Signal<T> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			slots: Mutex::new(SlotList { next_id: 0, slots: vec![] }),
		}
	}

	pub fn connect(&self, slot: impl Fn(&T) + Send + Sync + 'static) -> SlotId {
		let mut slots = self.slots.lock();
		let id = slots.next_id;
		slots.next_id += 1;
		slots.slots.push((id, Box::new(slot)));
		SlotId(id)
	}

	pub fn disconnect(&self, id: SlotId) {
		self.slots.lock().slots.retain(|(slot_id, _)| *slot_id != id.0);
	}

	pub fn emit(&self, value: &T) {
		let slots = self.slots.lock();
		for (_, slot) in &slots.slots {
			slot(value);
		}
	}
}

impl<T> Default for Signal<T> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
	use std::sync::Arc;

	#[test]
	fn disconnected_slots_stop_firing() {
		let signal = Signal::new();
		let count = Arc::new(AtomicUsize::new(0));

		let slot_count = count.clone();
		let slot = signal.connect(move |value: &usize| {
			slot_count.fetch_add(*value, Relaxed);
		});

		signal.emit(&3);
		signal.disconnect(slot);
		signal.emit(&5);

		assert_eq!(count.load(Relaxed), 3);
	}
}
