/// Index of a player input, monotonic modulo 256.
pub type InputIndex = u8;

/// Wraparound-aware input ordering: `a` is more recent than `b` when their modular distance is
/// less than half the index space.
#[must_use]
pub const fn is_input_more_recent(a: InputIndex, b: InputIndex) -> bool {
	a.wrapping_sub(b) < 128 && a != b
}

/// One tick worth of player intent, sampled on the client and replayed on the server.
///
/// `pitch` and `yaw` are the camera rotation deltas for this tick, in degrees, already clamped to
/// the per-tick rotation budget by the sender.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlayerInputs {
	pub index: InputIndex,

	pub jump: bool,
	pub crouch: bool,
	pub sprint: bool,
	pub move_forward: bool,
	pub move_backward: bool,
	pub move_left: bool,
	pub move_right: bool,

	pub pitch: f32,
	pub yaw: f32,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recency_handles_wraparound() {
		assert!(is_input_more_recent(5, 250));
		assert!(is_input_more_recent(120, 5));
		assert!(!is_input_more_recent(5, 120));
		assert!(!is_input_more_recent(250, 5));
	}

	#[test]
	fn equal_indices_are_not_more_recent() {
		assert!(!is_input_more_recent(42, 42));
	}

	#[test]
	fn successor_is_always_more_recent() {
		let mut index: InputIndex = 0;
		for _ in 0..512 {
			let next = index.wrapping_add(1);
			assert!(is_input_more_recent(next, index));
			assert!(!is_input_more_recent(index, next));
			index = next;
		}
	}
}
