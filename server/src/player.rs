use crate::entities::{EntityHandle, PlayerIndex};
use crate::visibility::SessionVisibilityHandler;
use lodestone_shared::character::CharacterController;
use lodestone_shared::inputs::PlayerInputs;
use lodestone_shared::network::PeerId;
use lodestone_shared::physics::CharacterHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct ServerPlayer {
	player_index: PlayerIndex,
	peer_id: PeerId,
	nickname: String,
	is_authenticated: bool,

	pub visibility: SessionVisibilityHandler,

	input_queue: VecDeque<PlayerInputs>,

	pub controlled_entity: Option<EntityHandle>,
	pub character: Option<PlayerCharacter>,
}

pub struct PlayerCharacter {
	pub controller: Arc<Mutex<CharacterController>>,
	pub handle: CharacterHandle,
}

impl ServerPlayer {
	#[must_use]
	pub fn new(player_index: PlayerIndex, peer_id: PeerId, nickname: String, is_authenticated: bool) -> Self {
		Self {
			player_index,
			peer_id,
			nickname,
			is_authenticated,
			visibility: SessionVisibilityHandler::new(),
			input_queue: VecDeque::new(),
			controlled_entity: None,
			character: None,
		}
	}

	#[must_use]
	pub const fn player_index(&self) -> PlayerIndex {
		self.player_index
	}

	#[must_use]
	pub const fn peer_id(&self) -> PeerId {
		self.peer_id
	}

	#[must_use]
	pub fn nickname(&self) -> &str {
		&self.nickname
	}

	pub fn update_nickname(&mut self, nickname: String) {
		self.nickname = nickname;
	}

	#[must_use]
	pub const fn is_authenticated(&self) -> bool {
		self.is_authenticated
	}

	pub fn push_inputs(&mut self, inputs: PlayerInputs) {
		self.input_queue.push_back(inputs);
	}

	/// Consumes exactly one queued input. With an empty queue the previous input keeps acting on
	/// the character, which is what makes movement survive jittery delivery.
	pub fn tick(&mut self) {
		if let Some(inputs) = self.input_queue.pop_front() {
			self.visibility.update_last_input_index(inputs.index);

			if let Some(character) = &self.character {
				character.controller.lock().set_inputs(inputs);
			}
		}
	}
}

/// Dense pool of players indexed by [`PlayerIndex`]. A slot is reused only after it has been
/// freed, so a stale index can at worst reach a new player, never uninitialized state.
pub struct PlayerPool {
	slots: Vec<Option<ServerPlayer>>,
}

impl PlayerPool {
	#[must_use]
	pub fn new() -> Self {
		Self { slots: vec![] }
	}

	pub fn insert(&mut self, build: impl FnOnce(PlayerIndex) -> ServerPlayer) -> PlayerIndex {
		let index = match self.slots.iter().position(Option::is_none) {
			Some(index) => index,
			None => {
				self.slots.push(None);
				self.slots.len() - 1
			}
		};

		let player_index = index as PlayerIndex;
		self.slots[index] = Some(build(player_index));
		player_index
	}

	pub fn remove(&mut self, player_index: PlayerIndex) -> Option<ServerPlayer> {
		self.slots.get_mut(player_index as usize)?.take()
	}

	#[must_use]
	pub fn get(&self, player_index: PlayerIndex) -> Option<&ServerPlayer> {
		self.slots.get(player_index as usize)?.as_ref()
	}

	#[must_use]
	pub fn get_mut(&mut self, player_index: PlayerIndex) -> Option<&mut ServerPlayer> {
		self.slots.get_mut(player_index as usize)?.as_mut()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.slots.iter().all(Option::is_none)
	}

	pub fn indices(&self) -> Vec<PlayerIndex> {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(index, slot)| slot.as_ref().map(|_| index as PlayerIndex))
			.collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ServerPlayer> {
		self.slots.iter().filter_map(Option::as_ref)
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerPlayer> {
		self.slots.iter_mut().filter_map(Option::as_mut)
	}
}

impl Default for PlayerPool {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn player(player_index: PlayerIndex) -> ServerPlayer {
		ServerPlayer::new(player_index, 0, format!("player-{player_index}"), false)
	}

	#[test]
	fn indices_are_reused_only_after_free() {
		let mut pool = PlayerPool::new();

		let first = pool.insert(player);
		let second = pool.insert(player);
		assert_ne!(first, second);

		pool.remove(first);
		let third = pool.insert(player);
		assert_eq!(third, first);
	}

	#[test]
	fn inputs_are_consumed_one_per_tick_in_order() {
		let mut subject = player(0);

		for index in [10u8, 11, 12] {
			subject.push_inputs(PlayerInputs { index, ..PlayerInputs::default() });
		}

		let mut seen = vec![];
		for _ in 0..3 {
			subject.tick();
			seen.push(subject.visibility.last_input_index());
		}

		assert_eq!(seen, vec![10, 11, 12]);
	}

	#[test]
	fn empty_queue_keeps_the_last_acknowledged_input() {
		let mut subject = player(0);

		subject.push_inputs(PlayerInputs { index: 42, ..PlayerInputs::default() });
		subject.tick();
		subject.tick();

		assert_eq!(subject.visibility.last_input_index(), 42);
	}
}
