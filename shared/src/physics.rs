use nalgebra::{Isometry3, UnitQuaternion, Vector3};
use parking_lot::{Condvar, Mutex};
use rapier3d::dynamics::{
	CCDSolver, ImpulseJointHandle, ImpulseJointSet, IntegrationParameters, IslandManager, MultibodyJointHandle,
	MultibodyJointSet, RigidBody, RigidBodyBuilder, RigidBodyHandle, RigidBodySet,
};
use rapier3d::geometry::{Collider, ColliderBuilder, ColliderHandle, ColliderSet, DefaultBroadPhase, NarrowPhase, Ray, Shape};
use rapier3d::pipeline::{PhysicsPipeline, QueryFilter, QueryPipeline};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel as channel, UnboundedReceiver as Receiver, UnboundedSender as Sender};

/// Callback surface driven around every physics step for player characters.
///
/// Implementations read and write the character's pose and velocities through
/// [`CharacterView`]; the world itself runs with zero global gravity, so any gravity is applied
/// here, per character.
pub trait CharacterImpl: Send {
	fn pre_simulate(&mut self, character: &mut CharacterView, elapsed: f32);
	fn post_simulate(&mut self, character: &mut CharacterView, elapsed: f32);
}

/// Mutable access to one character's body for the duration of a callback.
pub struct CharacterView<'a> {
	body: &'a mut RigidBody,
	up: &'a mut Vector3<f32>,
	on_ground: bool,
}

impl CharacterView<'_> {
	#[must_use]
	pub fn position(&self) -> Vector3<f32> {
		self.body.position().translation.vector
	}

	#[must_use]
	pub fn rotation(&self) -> UnitQuaternion<f32> {
		self.body.position().rotation
	}

	pub fn set_position_and_rotation(&mut self, position: Vector3<f32>, rotation: UnitQuaternion<f32>) {
		self.body.set_position(Isometry3::from_parts(position.into(), rotation), true);
	}

	pub fn set_rotation(&mut self, rotation: UnitQuaternion<f32>) {
		let position = self.position();
		self.set_position_and_rotation(position, rotation);
	}

	#[must_use]
	pub fn linear_velocity(&self) -> Vector3<f32> {
		*self.body.linvel()
	}

	pub fn set_linear_velocity(&mut self, velocity: Vector3<f32>) {
		self.body.set_linvel(velocity, true);
	}

	#[must_use]
	pub fn angular_velocity(&self) -> Vector3<f32> {
		*self.body.angvel()
	}

	pub fn set_angular_velocity(&mut self, velocity: Vector3<f32>) {
		self.body.set_angvel(velocity, true);
	}

	/// The character's local up vector, maintained by its controller.
	#[must_use]
	pub fn up(&self) -> Vector3<f32> {
		*self.up
	}

	pub fn set_up(&mut self, up: Vector3<f32>) {
		*self.up = up;
	}

	#[must_use]
	pub const fn is_on_ground(&self) -> bool {
		self.on_ground
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CharacterHandle(usize);

struct Character {
	handle: RigidBodyHandle,
	up: Vector3<f32>,
	ground_probe: f32,
	controller: Arc<Mutex<dyn CharacterImpl>>,
}

pub struct Physics {
	handle_drop_receiver: Receiver<HandleDrop>,
	handle_drop_sender: Sender<HandleDrop>,

	pipeline: PhysicsPipeline,
	integration_parameters: IntegrationParameters,
	islands: IslandManager,
	broad_phase: DefaultBroadPhase,
	narrow_phase: NarrowPhase,
	rigid_bodies: RigidBodySet,
	colliders: ColliderSet,
	impulse_joints: ImpulseJointSet,
	multibody_joints: MultibodyJointSet,
	ccd_solver: CCDSolver,
	query_pipeline: QueryPipeline,

	characters: Vec<Option<Character>>,
}

impl Physics {
	#[must_use]
	pub fn new() -> Self {
		let (handle_drop_sender, handle_drop_receiver) = channel();

		Self {
			handle_drop_receiver,
			handle_drop_sender,

			pipeline: PhysicsPipeline::default(),
			integration_parameters: IntegrationParameters::default(),
			islands: IslandManager::default(),
			broad_phase: DefaultBroadPhase::default(),
			narrow_phase: NarrowPhase::default(),
			rigid_bodies: RigidBodySet::default(),
			colliders: ColliderSet::default(),
			impulse_joints: ImpulseJointSet::default(),
			multibody_joints: MultibodyJointSet::default(),
			ccd_solver: CCDSolver::default(),
			query_pipeline: QueryPipeline::default(),

			characters: vec![],
		}
	}

	pub fn step(&mut self, elapsed: f32) {
		self.integration_parameters.dt = elapsed;

		self.reap_dropped_handles();

		self.query_pipeline.update(&self.colliders);

		for slot in 0..self.characters.len() {
			self.drive_character(slot, elapsed, CharacterPhase::Pre);
		}

		self.pipeline.step(
			&Vector3::zeros(),
			&self.integration_parameters,
			&mut self.islands,
			&mut self.broad_phase,
			&mut self.narrow_phase,
			&mut self.rigid_bodies,
			&mut self.colliders,
			&mut self.impulse_joints,
			&mut self.multibody_joints,
			&mut self.ccd_solver,
			None,
			&(),
			&(),
		);

		self.query_pipeline.update(&self.colliders);

		for slot in 0..self.characters.len() {
			self.drive_character(slot, elapsed, CharacterPhase::Post);
		}
	}

	/// Removes everything whose [`AutoCleanup`] handle was dropped since the last step. Holding a
	/// `Sender` ourselves means `try_recv` can only fail with Empty, which ends the drain.
	fn reap_dropped_handles(&mut self) {
		while let Ok(handle_drop) = self.handle_drop_receiver.try_recv() {
			match handle_drop {
				HandleDrop::RigidBody(handle) => {
					self.rigid_bodies.remove(
						handle,
						&mut self.islands,
						&mut self.colliders,
						&mut self.impulse_joints,
						&mut self.multibody_joints,
						true,
					);
				}
				HandleDrop::Collider(handle) => {
					self.colliders.remove(handle, &mut self.islands, &mut self.rigid_bodies, false);
				}
				HandleDrop::ImpulseJoint(handle) => {
					self.impulse_joints.remove(handle, false);
				}
				HandleDrop::MultibodyJoint(handle) => {
					self.multibody_joints.remove(handle, false);
				}
			}
		}
	}

	fn drive_character(&mut self, slot: usize, elapsed: f32, phase: CharacterPhase) {
		let Some(character) = &self.characters[slot] else { return };

		let handle = character.handle;
		let ground_probe = character.ground_probe;
		let controller = character.controller.clone();

		let on_ground = self.probe_ground(handle, ground_probe);

		let Some(character) = &mut self.characters[slot] else { return };
		let mut up = character.up;

		let Some(body) = self.rigid_bodies.get_mut(handle) else { return };
		let mut view = CharacterView { body, up: &mut up, on_ground };

		match phase {
			CharacterPhase::Pre => controller.lock().pre_simulate(&mut view, elapsed),
			CharacterPhase::Post => controller.lock().post_simulate(&mut view, elapsed),
		}

		if let Some(character) = &mut self.characters[slot] {
			character.up = up;
		}
	}

	fn probe_ground(&self, handle: RigidBodyHandle, probe_length: f32) -> bool {
		let Some(body) = self.rigid_bodies.get(handle) else {
			return false;
		};

		let up = body.position().rotation * Vector3::z();
		let ray = Ray::new(body.position().translation.vector.into(), -up);

		let filter = QueryFilter::default().exclude_rigid_body(handle);
		self.query_pipeline
			.cast_ray(&self.rigid_bodies, &self.colliders, &ray, probe_length, true, filter)
			.is_some()
	}

	/// Registers a dynamic character body with a locked-rotation capsule and its controller.
	pub fn add_character(
		&mut self,
		position: Vector3<f32>,
		rotation: UnitQuaternion<f32>,
		capsule_half_height: f32,
		capsule_radius: f32,
		controller: Arc<Mutex<dyn CharacterImpl>>,
	) -> CharacterHandle {
		let body = RigidBodyBuilder::dynamic()
			.position(Isometry3::from_parts(position.into(), rotation))
			.lock_rotations()
			.ccd_enabled(true)
			.build();

		let handle = self.rigid_bodies.insert(body);
		self.colliders.insert_with_parent(
			ColliderBuilder::capsule_z(capsule_half_height, capsule_radius).friction(1.0),
			handle,
			&mut self.rigid_bodies,
		);

		let character = Character {
			handle,
			up: rotation * Vector3::z(),
			ground_probe: capsule_half_height + capsule_radius + 0.1,
			controller,
		};

		let slot = self.characters.iter().position(Option::is_none).unwrap_or_else(|| {
			self.characters.push(None);
			self.characters.len() - 1
		});
		self.characters[slot] = Some(character);

		CharacterHandle(slot)
	}

	pub fn remove_character(&mut self, handle: CharacterHandle) {
		if let Some(character) = self.characters[handle.0].take() {
			self.rigid_bodies.remove(
				character.handle,
				&mut self.islands,
				&mut self.colliders,
				&mut self.impulse_joints,
				&mut self.multibody_joints,
				true,
			);
		}
	}

	#[must_use]
	pub fn character_body(&self, handle: CharacterHandle) -> Option<&RigidBody> {
		let character = self.characters.get(handle.0)?.as_ref()?;
		self.rigid_bodies.get(character.handle)
	}

	/// True when any collider overlaps `shape` at `pose`.
	#[must_use]
	pub fn collision_query(&self, shape: &dyn Shape, pose: &Isometry3<f32>) -> bool {
		self.query_pipeline
			.intersection_with_shape(&self.rigid_bodies, &self.colliders, pose, shape, QueryFilter::default())
			.is_some()
	}

	pub fn insert_rigid_body(&mut self, rigid_body: impl Into<RigidBody>) -> AutoCleanup<RigidBodyHandle> {
		AutoCleanup {
			handle: self.rigid_bodies.insert(rigid_body),
			handle_drop_sender: self.handle_drop_sender.clone(),
		}
	}

	pub fn insert_rigid_body_collider(
		&mut self,
		rigid_body_handle: RigidBodyHandle,
		collider: impl Into<Collider>,
	) -> AutoCleanup<ColliderHandle> {
		AutoCleanup {
			handle: self
				.colliders
				.insert_with_parent(collider, rigid_body_handle, &mut self.rigid_bodies),
			handle_drop_sender: self.handle_drop_sender.clone(),
		}
	}
}

impl Default for Physics {
	fn default() -> Self {
		Self::new()
	}
}

enum CharacterPhase {
	Pre,
	Post,
}

enum HandleDrop {
	Collider(ColliderHandle),
	RigidBody(RigidBodyHandle),
	ImpulseJoint(ImpulseJointHandle),
	MultibodyJoint(MultibodyJointHandle),
}

impl From<ColliderHandle> for HandleDrop {
	fn from(handle: ColliderHandle) -> Self {
		Self::Collider(handle)
	}
}

impl From<RigidBodyHandle> for HandleDrop {
	fn from(handle: RigidBodyHandle) -> Self {
		Self::RigidBody(handle)
	}
}

impl From<ImpulseJointHandle> for HandleDrop {
	fn from(handle: ImpulseJointHandle) -> Self {
		Self::ImpulseJoint(handle)
	}
}

impl From<MultibodyJointHandle> for HandleDrop {
	fn from(handle: MultibodyJointHandle) -> Self {
		Self::MultibodyJoint(handle)
	}
}

#[allow(private_bounds)] // HandleDrop is an implementation detail and stays private
pub struct AutoCleanup<T: Into<HandleDrop> + Copy> {
	pub handle: T,
	handle_drop_sender: Sender<HandleDrop>,
}

impl<T: Into<HandleDrop> + Copy> Deref for AutoCleanup<T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.handle
	}
}

impl<T: Into<HandleDrop> + Copy> DerefMut for AutoCleanup<T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.handle
	}
}

impl<T: Into<HandleDrop> + Copy> Drop for AutoCleanup<T> {
	fn drop(&mut self) {
		// A closed channel means the whole physics world went away first, taking the handle's
		// target with it; nothing left to queue
		let _ = self.handle_drop_sender.send(self.handle.into());
	}
}

/// Thread pool facade used for chunk generation and collider builds: pure functions over
/// immutable snapshots, spawned in a batch and rejoined on the main thread.
pub struct TaskScheduler {
	pending: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskScheduler {
	#[must_use]
	pub fn new() -> Self {
		Self {
			pending: Arc::new((Mutex::new(0), Condvar::new())),
		}
	}

	pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
		*self.pending.0.lock() += 1;

		let pending = self.pending.clone();
		rayon::spawn(move || {
			job();

			let mut count = pending.0.lock();
			*count -= 1;
			if *count == 0 {
				pending.1.notify_all();
			}
		});
	}

	/// Blocks until every job spawned so far has finished.
	pub fn wait_all(&self) {
		let mut count = self.pending.0.lock();
		while *count > 0 {
			self.pending.1.wait(&mut count);
		}
	}
}

impl Default for TaskScheduler {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn task_scheduler_joins_all_jobs() {
		use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

		let scheduler = TaskScheduler::new();
		let count = Arc::new(AtomicUsize::new(0));

		for _ in 0..32 {
			let count = count.clone();
			scheduler.spawn(move || {
				count.fetch_add(1, Relaxed);
			});
		}

		scheduler.wait_all();
		assert_eq!(count.load(Relaxed), 32);
	}
}
