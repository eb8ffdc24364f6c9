use crate::constants::{
	GRAVITY_MAX_ROTATION_SPEED, PLAYER_FLY_SPEED, PLAYER_JUMP_POWER, PLAYER_SPRINT_SPEED, PLAYER_WALK_SPEED,
};
use crate::inputs::PlayerInputs;
use crate::physics::{CharacterImpl, CharacterView};
use nalgebra::{UnitQuaternion, Vector3};
use std::sync::Arc;

/// Something that can tell a character which way is down and how hard.
pub trait GravitySource: Send + Sync {
	fn up_direction(&self, position: Vector3<f32>) -> Vector3<f32>;
	fn gravity_factor(&self, position: Vector3<f32>) -> f32;
}

impl GravitySource for crate::planet::Planet {
	fn up_direction(&self, position: Vector3<f32>) -> Vector3<f32> {
		self.compute_up_direction(position)
	}

	fn gravity_factor(&self, position: Vector3<f32>) -> f32 {
		crate::planet::Planet::gravity_factor(self, position)
	}
}

/// Server-authoritative character movement.
///
/// Holds the pose the rest of the engine reads: `rotation = reference_rotation · yaw(camera_yaw)`,
/// where the reference rotation is whatever aligns local up with the current gravity up. One
/// pending input is applied per simulation step, never twice.
pub struct CharacterController {
	gravity: Option<Arc<dyn GravitySource>>,

	camera_pitch: f32,
	camera_yaw: f32,
	reference_rotation: UnitQuaternion<f32>,
	character_position: Vector3<f32>,
	character_rotation: UnitQuaternion<f32>,
	gravity_up: Vector3<f32>,

	last_inputs: PlayerInputs,
	allow_input_rotation: bool,
	is_flying: bool,
}

impl CharacterController {
	#[must_use]
	pub fn new(gravity: Option<Arc<dyn GravitySource>>) -> Self {
		Self {
			gravity,
			camera_pitch: 0.0,
			camera_yaw: 0.0,
			reference_rotation: UnitQuaternion::identity(),
			character_position: Vector3::zeros(),
			character_rotation: UnitQuaternion::identity(),
			gravity_up: Vector3::zeros(),
			last_inputs: PlayerInputs::default(),
			allow_input_rotation: false,
			is_flying: false,
		}
	}

	/// Feeds the next input; its rotation part is consumed by exactly one simulation step.
	pub fn set_inputs(&mut self, inputs: PlayerInputs) {
		self.last_inputs = inputs;
		self.allow_input_rotation = true;
	}

	#[must_use]
	pub const fn camera_pitch(&self) -> f32 {
		self.camera_pitch
	}

	#[must_use]
	pub const fn camera_yaw(&self) -> f32 {
		self.camera_yaw
	}

	#[must_use]
	pub const fn reference_rotation(&self) -> UnitQuaternion<f32> {
		self.reference_rotation
	}

	#[must_use]
	pub const fn position(&self) -> Vector3<f32> {
		self.character_position
	}

	#[must_use]
	pub const fn rotation(&self) -> UnitQuaternion<f32> {
		self.character_rotation
	}

	#[must_use]
	pub const fn is_flying(&self) -> bool {
		self.is_flying
	}

	pub fn enable_flying(&mut self, flying: bool) {
		self.is_flying = flying;
	}

	/// Snaps the pose, used on respawn.
	pub fn reset_pose(&mut self, position: Vector3<f32>, reference_rotation: UnitQuaternion<f32>) {
		self.character_position = position;
		self.character_rotation = reference_rotation;
		self.reference_rotation = reference_rotation;
		self.camera_pitch = 0.0;
		self.camera_yaw = 0.0;
	}
}

impl CharacterImpl for CharacterController {
	fn pre_simulate(&mut self, character: &mut CharacterView, elapsed: f32) {
		self.character_position = character.position();
		self.character_rotation = character.rotation();

		let mut velocity = character.linear_velocity();
		let up = character.up();

		self.gravity_up = match &self.gravity {
			Some(gravity) if gravity.gravity_factor(self.character_position) > 0.3 => {
				gravity.up_direction(self.character_position)
			}
			_ => Vector3::zeros(),
		};

		if let Some(gravity) = &self.gravity {
			if !self.is_flying {
				velocity -= gravity.gravity_factor(self.character_position)
					* gravity.up_direction(self.character_position)
					* elapsed;
			}
		}

		if !self.is_flying && self.last_inputs.jump && character.is_on_ground() {
			velocity += up * PLAYER_JUMP_POWER;
		}

		let mut desired_velocity = Vector3::zeros();
		if self.last_inputs.move_forward {
			desired_velocity -= Vector3::y();
		}
		if self.last_inputs.move_backward {
			desired_velocity += Vector3::y();
		}
		if self.last_inputs.move_left {
			desired_velocity -= Vector3::x();
		}
		if self.last_inputs.move_right {
			desired_velocity += Vector3::x();
		}

		if self.is_flying {
			if self.last_inputs.jump {
				desired_velocity += Vector3::z();
			}
			if self.last_inputs.crouch {
				desired_velocity -= Vector3::z();
			}
		}

		if desired_velocity != Vector3::zeros() {
			desired_velocity.normalize_mut();
		}

		let move_speed = if self.is_flying {
			PLAYER_FLY_SPEED * if self.last_inputs.sprint { 2.0 } else { 1.0 }
		} else if self.last_inputs.sprint {
			PLAYER_SPRINT_SPEED
		} else {
			PLAYER_WALK_SPEED
		};

		let mut desired_velocity = self.character_rotation * desired_velocity * move_speed;

		let desired_impact = if self.is_flying {
			0.2
		} else if self.gravity_up.norm_squared() > 1.0e-4 {
			// Keep the along-gravity component so walking doesn't cancel falling
			desired_velocity += self.gravity_up * velocity.dot(&self.gravity_up);
			if character.is_on_ground() {
				0.25
			} else {
				0.1
			}
		} else {
			desired_velocity += velocity;
			0.1
		};

		character.set_linear_velocity(velocity.lerp(&desired_velocity, desired_impact));
	}

	fn post_simulate(&mut self, character: &mut CharacterView, elapsed: f32) {
		let character_up = character.up();

		let mut new_rotation = self.reference_rotation;
		let mut new_up = character_up;

		// Realign with the gravity well, bounded so walking over an edge doesn't snap the camera
		if self.gravity_up.norm_squared() > 1.0e-4 {
			new_up = rotate_towards(character_up, self.gravity_up, (GRAVITY_MAX_ROTATION_SPEED * elapsed).to_radians());

			let previous_up = new_rotation * Vector3::z();
			if (previous_up - new_up).norm_squared() > 1.0e-10 {
				if let Some(correction) = UnitQuaternion::rotation_between(&previous_up, &new_up) {
					new_rotation = correction * new_rotation;
				}
			}
		}

		self.reference_rotation = new_rotation;

		// Don't apply the same input rotation twice
		if self.allow_input_rotation && (self.last_inputs.pitch != 0.0 || self.last_inputs.yaw != 0.0) {
			self.camera_pitch = (self.camera_pitch + self.last_inputs.pitch).clamp(-89.0, 89.0);
			self.camera_yaw = (self.camera_yaw + self.last_inputs.yaw) % 360.0;
			self.allow_input_rotation = false;
		}

		let new_rotation =
			self.reference_rotation * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.camera_yaw.to_radians());

		if new_rotation.angle_to(&self.character_rotation) > 1.0e-5 {
			character.set_rotation(new_rotation);
			character.set_up(new_up);

			self.character_rotation = new_rotation;
		}
	}
}

/// Rotates `from` towards `to`, moving at most `max_angle` radians.
fn rotate_towards(from: Vector3<f32>, to: Vector3<f32>, max_angle: f32) -> Vector3<f32> {
	let angle = from.angle(&to);
	if angle <= max_angle || angle < 1.0e-6 {
		return to;
	}

	let axis = from.cross(&to);
	match nalgebra::Unit::try_new(axis, 1.0e-6) {
		Some(axis) => UnitQuaternion::from_axis_angle(&axis, max_angle) * from,
		// Antiparallel vectors, pick any orthogonal axis
		None => to,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rotate_towards_is_bounded() {
		let from = Vector3::z();
		let to = Vector3::x();

		let rotated = rotate_towards(from, to, 0.1);
		assert!((rotated.angle(&from) - 0.1).abs() < 1.0e-4);

		let rotated = rotate_towards(from, to, 3.0);
		assert!((rotated - to).norm() < 1.0e-4);
	}
}
