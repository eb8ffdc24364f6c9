//! Client-side prediction of the local camera rotation.
//!
//! Rotation is the one part of the character the client applies immediately instead of waiting
//! for the server: each tick a bounded slice of the accumulated mouse motion becomes part of the
//! outgoing input, is applied to the predicted camera rotation, and is remembered in a replay
//! list. When the server acknowledges inputs, everything up to the acknowledged index is dropped
//! and the remainder is replayed over the authoritative rotation, which converges without ever
//! rewinding the camera visibly.

use lodestone_shared::constants::PLAYER_ROTATION_SPEED;
use lodestone_shared::inputs::{is_input_more_recent, InputIndex, PlayerInputs};

#[derive(Clone, Copy, Debug, Default)]
pub struct MovementInputs {
	pub jump: bool,
	pub crouch: bool,
	pub sprint: bool,
	pub move_forward: bool,
	pub move_backward: bool,
	pub move_left: bool,
	pub move_right: bool,
}

#[derive(Clone, Copy, Debug)]
struct InputRotation {
	input_index: InputIndex,
	pitch: f32,
	yaw: f32,
}

pub struct RotationPredictor {
	next_input_index: InputIndex,

	incoming_pitch: f32,
	incoming_yaw: f32,
	remaining_pitch: f32,
	remaining_yaw: f32,

	predicted_pitch: f32,
	predicted_yaw: f32,

	replay: Vec<InputRotation>,
}

impl RotationPredictor {
	#[must_use]
	pub fn new() -> Self {
		Self {
			next_input_index: 1,
			incoming_pitch: 0.0,
			incoming_yaw: 0.0,
			remaining_pitch: 0.0,
			remaining_yaw: 0.0,
			predicted_pitch: 0.0,
			predicted_yaw: 0.0,
			replay: vec![],
		}
	}

	/// Raw mouse motion since the last tick, in degrees.
	pub fn accumulate_rotation(&mut self, pitch: f32, yaw: f32) {
		self.incoming_pitch += pitch;
		self.incoming_yaw += yaw;
	}

	/// Builds this tick's input packet: movement flags plus a rotation slice clamped to the
	/// per-input budget. The slice is applied to the local prediction right away.
	pub fn sample_inputs(&mut self, movement: MovementInputs) -> PlayerInputs {
		let index = self.next_input_index;
		self.next_input_index = self.next_input_index.wrapping_add(1);

		self.remaining_pitch += std::mem::take(&mut self.incoming_pitch);
		self.remaining_yaw += std::mem::take(&mut self.incoming_yaw);

		let pitch = self.remaining_pitch.clamp(-PLAYER_ROTATION_SPEED, PLAYER_ROTATION_SPEED);
		let yaw = self.remaining_yaw.clamp(-PLAYER_ROTATION_SPEED, PLAYER_ROTATION_SPEED);
		self.remaining_pitch -= pitch;
		self.remaining_yaw -= yaw;

		if pitch != 0.0 || yaw != 0.0 {
			self.predicted_pitch = (self.predicted_pitch + pitch).clamp(-89.0, 89.0);
			self.predicted_yaw = (self.predicted_yaw + yaw) % 360.0;

			self.replay.push(InputRotation { input_index: index, pitch, yaw });
		}

		PlayerInputs {
			index,
			jump: movement.jump,
			crouch: movement.crouch,
			sprint: movement.sprint,
			move_forward: movement.move_forward,
			move_backward: movement.move_backward,
			move_left: movement.move_left,
			move_right: movement.move_right,
			pitch,
			yaw,
		}
	}

	/// Applies an authoritative camera rotation: drops acknowledged replay entries, snaps to the
	/// server state and replays whatever the server hasn't seen yet.
	pub fn reconcile(&mut self, last_input_index: InputIndex, camera_pitch: f32, camera_yaw: f32) {
		self.replay
			.retain(|rotation| is_input_more_recent(rotation.input_index, last_input_index));

		self.predicted_pitch = camera_pitch;
		self.predicted_yaw = camera_yaw;

		for rotation in &self.replay {
			self.predicted_pitch = (self.predicted_pitch + rotation.pitch).clamp(-89.0, 89.0);
			self.predicted_yaw = (self.predicted_yaw + rotation.yaw) % 360.0;
		}
	}

	#[must_use]
	pub const fn predicted_pitch(&self) -> f32 {
		self.predicted_pitch
	}

	#[must_use]
	pub const fn predicted_yaw(&self) -> f32 {
		self.predicted_yaw
	}

	#[must_use]
	pub fn pending_replay_len(&self) -> usize {
		self.replay.len()
	}
}

impl Default for RotationPredictor {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_with_pitch(predictor: &mut RotationPredictor, pitch: f32) -> PlayerInputs {
		predictor.accumulate_rotation(pitch, 0.0);
		predictor.sample_inputs(MovementInputs::default())
	}

	#[test]
	fn acknowledged_prefix_is_dropped_and_remainder_replayed() {
		let mut predictor = RotationPredictor::new();

		// Three ticks of +5° pitch, indices 1..=3
		for _ in 0..3 {
			sample_with_pitch(&mut predictor, 5.0);
		}
		assert_eq!(predictor.predicted_pitch(), 15.0);

		// Server acknowledges input 1 at +5°: replay keeps 2 and 3, prediction is unchanged
		predictor.reconcile(1, 5.0, 0.0);
		assert_eq!(predictor.pending_replay_len(), 2);
		assert_eq!(predictor.predicted_pitch(), 15.0);
	}

	#[test]
	fn reconciliation_is_a_fixpoint_with_an_empty_replay_list() {
		let mut predictor = RotationPredictor::new();

		let inputs = sample_with_pitch(&mut predictor, 12.0);
		predictor.reconcile(inputs.index, predictor.predicted_pitch(), predictor.predicted_yaw());

		assert_eq!(predictor.pending_replay_len(), 0);
		assert_eq!(predictor.predicted_pitch(), 12.0);

		// Acknowledging the same state again changes nothing
		predictor.reconcile(inputs.index, 12.0, 0.0);
		assert_eq!(predictor.predicted_pitch(), 12.0);
	}

	#[test]
	fn oversized_rotation_is_budgeted_across_ticks() {
		let mut predictor = RotationPredictor::new();

		predictor.accumulate_rotation(0.0, PLAYER_ROTATION_SPEED * 1.5);

		let first = predictor.sample_inputs(MovementInputs::default());
		assert_eq!(first.yaw, PLAYER_ROTATION_SPEED);

		let second = predictor.sample_inputs(MovementInputs::default());
		assert_eq!(second.yaw, PLAYER_ROTATION_SPEED * 0.5);
	}

	#[test]
	fn pitch_prediction_clamps_at_the_poles() {
		let mut predictor = RotationPredictor::new();

		sample_with_pitch(&mut predictor, 80.0);
		sample_with_pitch(&mut predictor, 80.0);

		assert_eq!(predictor.predicted_pitch(), 89.0);
	}

	#[test]
	fn replay_indices_survive_wraparound() {
		let mut predictor = RotationPredictor::new();

		// Advance the input index close to the wrap point
		for _ in 0..253 {
			predictor.sample_inputs(MovementInputs::default());
		}

		let a = sample_with_pitch(&mut predictor, 1.0); // index 254
		let b = sample_with_pitch(&mut predictor, 1.0); // index 255
		let c = sample_with_pitch(&mut predictor, 1.0); // index 0 after wrap
		assert_eq!(a.index, 254);
		assert_eq!(b.index, 255);
		assert_eq!(c.index, 0);

		predictor.reconcile(255, 2.0, 0.0);
		assert_eq!(predictor.pending_replay_len(), 1);
		assert_eq!(predictor.predicted_pitch(), 3.0);
	}
}
