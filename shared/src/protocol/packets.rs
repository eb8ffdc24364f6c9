//! The canonical packet list and its wire layout.
//!
//! Opcodes are the index of a packet in [`Packet::NAMES`]; the first two entries are frozen so
//! version negotiation works against any peer. Everything after `AuthResponse` may change between
//! protocol versions, guarded by the version both serializers are tagged with.

use crate::codec;
use crate::constants::{CHAT_MAX_MESSAGE_LENGTH, CHAT_MAX_PLAYER_MESSAGE_LENGTH, PLAYER_MAX_NICKNAME_LENGTH};
use crate::inputs::{InputIndex, PlayerInputs};
use crate::protocol::serializer::{PacketReader, PacketWriter, ProtocolError};
use crate::version::CHUNK_COMPRESSION_VERSION;
use nalgebra::{UnitQuaternion, Vector3};

pub type ChunkId = u16;
pub type EntityId = u16;
pub type EnvironmentId = u8;
pub type PlayerIndex = u16;

pub const CONNECTION_TOKEN_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketReliability {
	Reliable,
	Unreliable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AuthError {
	ServerIsOutdated = 0,
	UpgradeRequired = 1,
	ProtocolError = 2,
	InvalidToken = 3,
}

impl AuthError {
	fn from_u8(value: u8) -> Result<Self, ProtocolError> {
		match value {
			0 => Ok(Self::ServerIsOutdated),
			1 => Ok(Self::UpgradeRequired),
			2 => Ok(Self::ProtocolError),
			3 => Ok(Self::InvalidToken),
			_ => Err(ProtocolError::InvalidValue),
		}
	}
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VoxelLocation {
	pub x: u8,
	pub y: u8,
	pub z: u8,
}

impl VoxelLocation {
	#[must_use]
	pub fn from_indices(indices: Vector3<u32>) -> Self {
		Self { x: indices.x as u8, y: indices.y as u8, z: indices.z as u8 }
	}

	#[must_use]
	pub fn indices(self) -> Vector3<u32> {
		Vector3::new(self.x as u32, self.y as u32, self.z as u32)
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntityState {
	pub position: Vector3<f32>,
	pub rotation: UnitQuaternion<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvironmentTransform {
	pub translation: Vector3<f32>,
	pub rotation: UnitQuaternion<f32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlayerControlledData {
	pub controlling_player: PlayerIndex,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthRequest {
	pub game_version: u32,
	pub nickname: String,
	pub connection_token: Option<[u8; CONNECTION_TOKEN_LENGTH]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthResponse {
	pub result: Result<PlayerIndex, AuthError>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
	pub player_index: Option<PlayerIndex>,
	pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkCreate {
	pub tick_index: u16,
	pub chunk_id: ChunkId,
	pub location: Vector3<i32>,
	pub size: Vector3<u32>,
	pub tile_size: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkDestroy {
	pub tick_index: u16,
	pub chunk_id: ChunkId,
}

/// Full chunk contents as produced by [`crate::codec::serialize_chunk`]. The payload travels LZ4
/// compressed from protocol 0.3.1 on; older peers receive it raw.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkReset {
	pub tick_index: u16,
	pub chunk_id: ChunkId,
	pub content: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockUpdateEntry {
	pub location: VoxelLocation,
	pub new_block: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkUpdate {
	pub tick_index: u16,
	pub chunk_id: ChunkId,
	pub updates: Vec<BlockUpdateEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityCreationData {
	pub entity_id: EntityId,
	pub initial_state: EntityState,
	pub player_controlled: Option<PlayerControlledData>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntitiesCreation {
	pub tick_index: u16,
	pub entities: Vec<EntityCreationData>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntitiesDelete {
	pub tick_index: u16,
	pub entities: Vec<EntityId>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlledCharacterState {
	pub camera_pitch: f32,
	pub camera_yaw: f32,
	pub reference_rotation: UnitQuaternion<f32>,
	pub position: Vector3<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntityStateData {
	pub entity_id: EntityId,
	pub state: EntityState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntitiesStateUpdate {
	pub tick_index: u16,
	pub last_input_index: InputIndex,
	pub controlled_character: Option<ControlledCharacterState>,
	pub entities: Vec<EntityStateData>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntityEnvironmentUpdate {
	pub tick_index: u16,
	pub entity: EntityId,
	pub new_environment: EnvironmentId,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvironmentCreate {
	pub tick_index: u16,
	pub id: EnvironmentId,
	pub transform: EnvironmentTransform,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnvironmentDestroy {
	pub tick_index: u16,
	pub id: EnvironmentId,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvironmentUpdate {
	pub tick_index: u16,
	pub id: EnvironmentId,
	pub transform: EnvironmentTransform,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameDataPlayer {
	pub index: PlayerIndex,
	pub nickname: String,
	pub is_authenticated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameData {
	pub tick_index: u16,
	pub players: Vec<GameDataPlayer>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MineBlock {
	pub chunk_id: ChunkId,
	pub location: VoxelLocation,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkStrings {
	pub start_id: u32,
	pub strings: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlaceBlock {
	pub chunk_id: ChunkId,
	pub location: VoxelLocation,
	pub new_block: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlayerLeave {
	pub index: PlayerIndex,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerJoin {
	pub index: PlayerIndex,
	pub nickname: String,
	pub is_authenticated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerNameUpdate {
	pub index: PlayerIndex,
	pub new_nickname: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SendChatMessage {
	pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UpdateRootEnvironment {
	pub new_root: EnvironmentId,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdatePlayerInputs {
	pub inputs: PlayerInputs,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
	AuthRequest(AuthRequest),
	AuthResponse(AuthResponse),
	ChatMessage(ChatMessage),
	ChunkCreate(ChunkCreate),
	ChunkDestroy(ChunkDestroy),
	ChunkReset(ChunkReset),
	ChunkUpdate(ChunkUpdate),
	EntitiesCreation(EntitiesCreation),
	EntitiesDelete(EntitiesDelete),
	EntitiesStateUpdate(EntitiesStateUpdate),
	EntityEnvironmentUpdate(EntityEnvironmentUpdate),
	EnvironmentCreate(EnvironmentCreate),
	EnvironmentDestroy(EnvironmentDestroy),
	EnvironmentUpdate(EnvironmentUpdate),
	GameData(GameData),
	MineBlock(MineBlock),
	NetworkStrings(NetworkStrings),
	PlaceBlock(PlaceBlock),
	PlayerLeave(PlayerLeave),
	PlayerJoin(PlayerJoin),
	PlayerNameUpdate(PlayerNameUpdate),
	SendChatMessage(SendChatMessage),
	UpdateRootEnvironment(UpdateRootEnvironment),
	UpdatePlayerInputs(UpdatePlayerInputs),
}

impl Packet {
	pub const NAMES: [&'static str; 24] = [
		"AuthRequest",
		"AuthResponse",
		"ChatMessage",
		"ChunkCreate",
		"ChunkDestroy",
		"ChunkReset",
		"ChunkUpdate",
		"EntitiesCreation",
		"EntitiesDelete",
		"EntitiesStateUpdate",
		"EntityEnvironmentUpdate",
		"EnvironmentCreate",
		"EnvironmentDestroy",
		"EnvironmentUpdate",
		"GameData",
		"MineBlock",
		"NetworkStrings",
		"PlaceBlock",
		"PlayerLeave",
		"PlayerJoin",
		"PlayerNameUpdate",
		"SendChatMessage",
		"UpdateRootEnvironment",
		"UpdatePlayerInputs",
	];

	#[must_use]
	pub const fn opcode(&self) -> u8 {
		match self {
			Self::AuthRequest(_) => 0,
			Self::AuthResponse(_) => 1,
			Self::ChatMessage(_) => 2,
			Self::ChunkCreate(_) => 3,
			Self::ChunkDestroy(_) => 4,
			Self::ChunkReset(_) => 5,
			Self::ChunkUpdate(_) => 6,
			Self::EntitiesCreation(_) => 7,
			Self::EntitiesDelete(_) => 8,
			Self::EntitiesStateUpdate(_) => 9,
			Self::EntityEnvironmentUpdate(_) => 10,
			Self::EnvironmentCreate(_) => 11,
			Self::EnvironmentDestroy(_) => 12,
			Self::EnvironmentUpdate(_) => 13,
			Self::GameData(_) => 14,
			Self::MineBlock(_) => 15,
			Self::NetworkStrings(_) => 16,
			Self::PlaceBlock(_) => 17,
			Self::PlayerLeave(_) => 18,
			Self::PlayerJoin(_) => 19,
			Self::PlayerNameUpdate(_) => 20,
			Self::SendChatMessage(_) => 21,
			Self::UpdateRootEnvironment(_) => 22,
			Self::UpdatePlayerInputs(_) => 23,
		}
	}

	#[must_use]
	pub const fn name(&self) -> &'static str {
		Self::NAMES[self.opcode() as usize]
	}

	/// Host channel the packet travels on. Chunk traffic and block edits share a channel so their
	/// relative order is preserved, entity traffic gets its own.
	#[must_use]
	pub const fn channel(&self) -> u8 {
		match self {
			Self::AuthRequest(_)
			| Self::AuthResponse(_)
			| Self::ChatMessage(_)
			| Self::NetworkStrings(_)
			| Self::SendChatMessage(_) => 0,

			Self::ChunkCreate(_)
			| Self::ChunkDestroy(_)
			| Self::ChunkReset(_)
			| Self::ChunkUpdate(_)
			| Self::MineBlock(_)
			| Self::PlaceBlock(_)
			| Self::UpdatePlayerInputs(_) => 1,

			Self::EntitiesCreation(_)
			| Self::EntitiesDelete(_)
			| Self::EntitiesStateUpdate(_)
			| Self::EntityEnvironmentUpdate(_)
			| Self::EnvironmentCreate(_)
			| Self::EnvironmentDestroy(_)
			| Self::EnvironmentUpdate(_)
			| Self::GameData(_)
			| Self::PlayerLeave(_)
			| Self::PlayerJoin(_)
			| Self::PlayerNameUpdate(_)
			| Self::UpdateRootEnvironment(_) => 2,
		}
	}

	#[must_use]
	pub const fn reliability(&self) -> PacketReliability {
		match self {
			Self::EntitiesStateUpdate(_) | Self::UpdatePlayerInputs(_) => PacketReliability::Unreliable,
			_ => PacketReliability::Reliable,
		}
	}

	/// Serializes the packet, opcode included, for the given negotiated protocol version.
	#[must_use]
	pub fn encode(&self, protocol_version: u32) -> Vec<u8> {
		let mut writer = PacketWriter::new(protocol_version);
		writer.put_u8(self.opcode());
		self.serialize(&mut writer);
		writer.into_inner()
	}

	/// Parses one full packet, opcode included.
	pub fn decode(data: &[u8], protocol_version: u32) -> Result<Self, ProtocolError> {
		let mut reader = PacketReader::new(data, protocol_version);
		let opcode = reader.get_u8()?;
		Self::deserialize(opcode, &mut reader)
	}

	fn serialize(&self, writer: &mut PacketWriter) {
		match self {
			Self::AuthRequest(data) => {
				writer.put_u32(data.game_version);
				writer.put_string::<PLAYER_MAX_NICKNAME_LENGTH>(&data.nickname);
				writer.put_bool(data.connection_token.is_some());
				if let Some(token) = &data.connection_token {
					writer.put_raw(token);
				}
			}
			Self::AuthResponse(data) => match data.result {
				Ok(player_index) => {
					writer.put_bool(true);
					writer.put_u16(player_index);
				}
				Err(error) => {
					writer.put_bool(false);
					writer.put_u8(error as u8);
				}
			},
			Self::ChatMessage(data) => {
				writer.put_string::<CHAT_MAX_MESSAGE_LENGTH>(&data.message);
				writer.put_bool(data.player_index.is_some());
				if let Some(player_index) = data.player_index {
					writer.put_u16(player_index);
				}
			}
			Self::ChunkCreate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u16(data.chunk_id);
				writer.put_varint_signed(data.location.x as i64);
				writer.put_varint_signed(data.location.y as i64);
				writer.put_varint_signed(data.location.z as i64);
				writer.put_varint(data.size.x as u64);
				writer.put_varint(data.size.y as u64);
				writer.put_varint(data.size.z as u64);
				writer.put_f32(data.tile_size);
			}
			Self::ChunkDestroy(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u16(data.chunk_id);
			}
			Self::ChunkReset(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u16(data.chunk_id);

				if writer.protocol_version() >= CHUNK_COMPRESSION_VERSION {
					writer.put_bytes(&codec::compress_chunk_payload(&data.content));
				} else {
					writer.put_bytes(&data.content);
				}
			}
			Self::ChunkUpdate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u16(data.chunk_id);
				writer.put_varint(data.updates.len() as u64);
				for update in &data.updates {
					writer.put_u8(update.location.x);
					writer.put_u8(update.location.y);
					writer.put_u8(update.location.z);
					writer.put_u8(update.new_block);
				}
			}
			Self::EntitiesCreation(data) => {
				writer.put_u16(data.tick_index);
				writer.put_varint(data.entities.len() as u64);
				for entity in &data.entities {
					writer.put_u16(entity.entity_id);
					writer.put_vector3(entity.initial_state.position);
					writer.put_quaternion(entity.initial_state.rotation);
					writer.put_bool(entity.player_controlled.is_some());
					if let Some(controlled) = &entity.player_controlled {
						writer.put_u16(controlled.controlling_player);
					}
				}
			}
			Self::EntitiesDelete(data) => {
				writer.put_u16(data.tick_index);
				writer.put_varint(data.entities.len() as u64);
				for entity_id in &data.entities {
					writer.put_u16(*entity_id);
				}
			}
			Self::EntitiesStateUpdate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u8(data.last_input_index);
				writer.put_bool(data.controlled_character.is_some());

				writer.put_varint(data.entities.len() as u64);
				for entity in &data.entities {
					writer.put_u16(entity.entity_id);
					writer.put_vector3(entity.state.position);
					writer.put_quaternion(entity.state.rotation);
				}

				if let Some(character) = &data.controlled_character {
					writer.put_vector3(character.position);
					writer.put_quaternion(character.reference_rotation);
					writer.put_f32(character.camera_pitch);
					writer.put_f32(character.camera_yaw);
				}
			}
			Self::EntityEnvironmentUpdate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u16(data.entity);
				writer.put_u8(data.new_environment);
			}
			Self::EnvironmentCreate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u8(data.id);
				writer.put_vector3(data.transform.translation);
				writer.put_quaternion(data.transform.rotation);
			}
			Self::EnvironmentDestroy(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u8(data.id);
			}
			Self::EnvironmentUpdate(data) => {
				writer.put_u16(data.tick_index);
				writer.put_u8(data.id);
				writer.put_vector3(data.transform.translation);
				writer.put_quaternion(data.transform.rotation);
			}
			Self::GameData(data) => {
				writer.put_u16(data.tick_index);
				writer.put_varint(data.players.len() as u64);
				for player in &data.players {
					writer.put_u16(player.index);
					writer.put_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>(&player.nickname);
					writer.put_bool(player.is_authenticated);
				}
			}
			Self::MineBlock(data) => {
				writer.put_u16(data.chunk_id);
				writer.put_u8(data.location.x);
				writer.put_u8(data.location.y);
				writer.put_u8(data.location.z);
			}
			Self::NetworkStrings(data) => {
				writer.put_varint(data.start_id as u64);
				writer.put_varint(data.strings.len() as u64);
				for string in &data.strings {
					writer.put_string::<1024>(string);
				}
			}
			Self::PlaceBlock(data) => {
				writer.put_u16(data.chunk_id);
				writer.put_u8(data.location.x);
				writer.put_u8(data.location.y);
				writer.put_u8(data.location.z);
				writer.put_u8(data.new_block);
			}
			Self::PlayerLeave(data) => {
				writer.put_u16(data.index);
			}
			Self::PlayerJoin(data) => {
				writer.put_u16(data.index);
				writer.put_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>(&data.nickname);
				writer.put_bool(data.is_authenticated);
			}
			Self::PlayerNameUpdate(data) => {
				writer.put_u16(data.index);
				writer.put_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>(&data.new_nickname);
			}
			Self::SendChatMessage(data) => {
				writer.put_string::<CHAT_MAX_PLAYER_MESSAGE_LENGTH>(&data.message);
			}
			Self::UpdateRootEnvironment(data) => {
				writer.put_u8(data.new_root);
			}
			Self::UpdatePlayerInputs(data) => {
				let inputs = &data.inputs;
				writer.put_u8(inputs.index);
				writer.put_bool(inputs.jump);
				writer.put_bool(inputs.crouch);
				writer.put_bool(inputs.sprint);
				writer.put_bool(inputs.move_forward);
				writer.put_bool(inputs.move_backward);
				writer.put_bool(inputs.move_left);
				writer.put_bool(inputs.move_right);
				writer.put_f32(inputs.pitch);
				writer.put_f32(inputs.yaw);
			}
		}
	}

	fn deserialize(opcode: u8, reader: &mut PacketReader) -> Result<Self, ProtocolError> {
		Ok(match opcode {
			0 => {
				let game_version = reader.get_u32()?;
				let nickname = reader.get_string::<PLAYER_MAX_NICKNAME_LENGTH>()?;
				let connection_token = match reader.get_bool()? {
					false => None,
					true => {
						let mut token = [0u8; CONNECTION_TOKEN_LENGTH];
						for byte in &mut token {
							*byte = reader.get_u8()?;
						}
						Some(token)
					}
				};
				Self::AuthRequest(AuthRequest { game_version, nickname, connection_token })
			}
			1 => {
				let result = match reader.get_bool()? {
					true => Ok(reader.get_u16()?),
					false => Err(AuthError::from_u8(reader.get_u8()?)?),
				};
				Self::AuthResponse(AuthResponse { result })
			}
			2 => {
				let message = reader.get_string::<CHAT_MAX_MESSAGE_LENGTH>()?;
				let player_index = match reader.get_bool()? {
					true => Some(reader.get_u16()?),
					false => None,
				};
				Self::ChatMessage(ChatMessage { player_index, message })
			}
			3 => Self::ChunkCreate(ChunkCreate {
				tick_index: reader.get_u16()?,
				chunk_id: reader.get_u16()?,
				location: Vector3::new(
					reader.get_varint_signed()? as i32,
					reader.get_varint_signed()? as i32,
					reader.get_varint_signed()? as i32,
				),
				size: Vector3::new(
					reader.get_varint()? as u32,
					reader.get_varint()? as u32,
					reader.get_varint()? as u32,
				),
				tile_size: reader.get_f32()?,
			}),
			4 => Self::ChunkDestroy(ChunkDestroy {
				tick_index: reader.get_u16()?,
				chunk_id: reader.get_u16()?,
			}),
			5 => {
				let tick_index = reader.get_u16()?;
				let chunk_id = reader.get_u16()?;
				let payload = reader.get_bytes()?;

				let content = if reader.protocol_version() >= CHUNK_COMPRESSION_VERSION {
					codec::decompress_chunk_payload(&payload)?
				} else {
					payload
				};

				Self::ChunkReset(ChunkReset { tick_index, chunk_id, content })
			}
			6 => {
				let tick_index = reader.get_u16()?;
				let chunk_id = reader.get_u16()?;
				let count = reader.get_varint()? as usize;

				let mut updates = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					updates.push(BlockUpdateEntry {
						location: VoxelLocation { x: reader.get_u8()?, y: reader.get_u8()?, z: reader.get_u8()? },
						new_block: reader.get_u8()?,
					});
				}

				Self::ChunkUpdate(ChunkUpdate { tick_index, chunk_id, updates })
			}
			7 => {
				let tick_index = reader.get_u16()?;
				let count = reader.get_varint()? as usize;

				let mut entities = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					let entity_id = reader.get_u16()?;
					let initial_state = EntityState {
						position: reader.get_vector3()?,
						rotation: reader.get_quaternion()?,
					};
					let player_controlled = match reader.get_bool()? {
						true => Some(PlayerControlledData { controlling_player: reader.get_u16()? }),
						false => None,
					};
					entities.push(EntityCreationData { entity_id, initial_state, player_controlled });
				}

				Self::EntitiesCreation(EntitiesCreation { tick_index, entities })
			}
			8 => {
				let tick_index = reader.get_u16()?;
				let count = reader.get_varint()? as usize;

				let mut entities = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					entities.push(reader.get_u16()?);
				}

				Self::EntitiesDelete(EntitiesDelete { tick_index, entities })
			}
			9 => {
				let tick_index = reader.get_u16()?;
				let last_input_index = reader.get_u8()?;
				let has_controlled = reader.get_bool()?;

				let count = reader.get_varint()? as usize;
				let mut entities = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					entities.push(EntityStateData {
						entity_id: reader.get_u16()?,
						state: EntityState {
							position: reader.get_vector3()?,
							rotation: reader.get_quaternion()?,
						},
					});
				}

				let controlled_character = match has_controlled {
					true => Some(ControlledCharacterState {
						position: reader.get_vector3()?,
						reference_rotation: reader.get_quaternion()?,
						camera_pitch: reader.get_f32()?,
						camera_yaw: reader.get_f32()?,
					}),
					false => None,
				};

				Self::EntitiesStateUpdate(EntitiesStateUpdate {
					tick_index,
					last_input_index,
					controlled_character,
					entities,
				})
			}
			10 => Self::EntityEnvironmentUpdate(EntityEnvironmentUpdate {
				tick_index: reader.get_u16()?,
				entity: reader.get_u16()?,
				new_environment: reader.get_u8()?,
			}),
			11 => Self::EnvironmentCreate(EnvironmentCreate {
				tick_index: reader.get_u16()?,
				id: reader.get_u8()?,
				transform: EnvironmentTransform {
					translation: reader.get_vector3()?,
					rotation: reader.get_quaternion()?,
				},
			}),
			12 => Self::EnvironmentDestroy(EnvironmentDestroy {
				tick_index: reader.get_u16()?,
				id: reader.get_u8()?,
			}),
			13 => Self::EnvironmentUpdate(EnvironmentUpdate {
				tick_index: reader.get_u16()?,
				id: reader.get_u8()?,
				transform: EnvironmentTransform {
					translation: reader.get_vector3()?,
					rotation: reader.get_quaternion()?,
				},
			}),
			14 => {
				let tick_index = reader.get_u16()?;
				let count = reader.get_varint()? as usize;

				let mut players = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					players.push(GameDataPlayer {
						index: reader.get_u16()?,
						nickname: reader.get_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>()?,
						is_authenticated: reader.get_bool()?,
					});
				}

				Self::GameData(GameData { tick_index, players })
			}
			15 => Self::MineBlock(MineBlock {
				chunk_id: reader.get_u16()?,
				location: VoxelLocation { x: reader.get_u8()?, y: reader.get_u8()?, z: reader.get_u8()? },
			}),
			16 => {
				let start_id = reader.get_varint()? as u32;
				let count = reader.get_varint()? as usize;

				let mut strings = Vec::with_capacity(count.min(4096));
				for _ in 0..count {
					strings.push(reader.get_string::<1024>()?);
				}

				Self::NetworkStrings(NetworkStrings { start_id, strings })
			}
			17 => Self::PlaceBlock(PlaceBlock {
				chunk_id: reader.get_u16()?,
				location: VoxelLocation { x: reader.get_u8()?, y: reader.get_u8()?, z: reader.get_u8()? },
				new_block: reader.get_u8()?,
			}),
			18 => Self::PlayerLeave(PlayerLeave { index: reader.get_u16()? }),
			19 => Self::PlayerJoin(PlayerJoin {
				index: reader.get_u16()?,
				nickname: reader.get_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>()?,
				is_authenticated: reader.get_bool()?,
			}),
			20 => Self::PlayerNameUpdate(PlayerNameUpdate {
				index: reader.get_u16()?,
				new_nickname: reader.get_string::<{ PLAYER_MAX_NICKNAME_LENGTH * 2 }>()?,
			}),
			21 => Self::SendChatMessage(SendChatMessage {
				message: reader.get_string::<CHAT_MAX_PLAYER_MESSAGE_LENGTH>()?,
			}),
			22 => Self::UpdateRootEnvironment(UpdateRootEnvironment { new_root: reader.get_u8()? }),
			23 => {
				let mut inputs = PlayerInputs {
					index: reader.get_u8()?,
					..PlayerInputs::default()
				};
				inputs.jump = reader.get_bool()?;
				inputs.crouch = reader.get_bool()?;
				inputs.sprint = reader.get_bool()?;
				inputs.move_forward = reader.get_bool()?;
				inputs.move_backward = reader.get_bool()?;
				inputs.move_left = reader.get_bool()?;
				inputs.move_right = reader.get_bool()?;
				inputs.pitch = reader.get_f32()?;
				inputs.yaw = reader.get_f32()?;

				Self::UpdatePlayerInputs(UpdatePlayerInputs { inputs })
			}
			_ => return Err(ProtocolError::UnknownOpcode(opcode)),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::version::{build_version, GAME_VERSION};

	fn round_trip(packet: Packet, protocol_version: u32) -> Packet {
		let encoded = packet.encode(protocol_version);
		assert_eq!(encoded[0], packet.opcode());
		Packet::decode(&encoded, protocol_version).expect("decoding must succeed")
	}

	#[test]
	fn auth_packets_round_trip() {
		let request = Packet::AuthRequest(AuthRequest {
			game_version: GAME_VERSION,
			nickname: "lyra".into(),
			connection_token: Some([7; CONNECTION_TOKEN_LENGTH]),
		});
		assert_eq!(round_trip(request.clone(), GAME_VERSION), request);

		let ok = Packet::AuthResponse(AuthResponse { result: Ok(3) });
		assert_eq!(round_trip(ok.clone(), GAME_VERSION), ok);

		let err = Packet::AuthResponse(AuthResponse { result: Err(AuthError::UpgradeRequired) });
		assert_eq!(round_trip(err.clone(), GAME_VERSION), err);
	}

	#[test]
	fn auth_opcodes_are_frozen() {
		let request = Packet::AuthRequest(AuthRequest {
			game_version: GAME_VERSION,
			nickname: String::new(),
			connection_token: None,
		});
		let response = Packet::AuthResponse(AuthResponse { result: Err(AuthError::ProtocolError) });

		assert_eq!(request.opcode(), 0);
		assert_eq!(response.opcode(), 1);
	}

	#[test]
	fn chunk_create_uses_signed_varints_for_location() {
		let packet = Packet::ChunkCreate(ChunkCreate {
			tick_index: 90,
			chunk_id: 4,
			location: Vector3::new(-3, 0, 12),
			size: Vector3::new(32, 32, 32),
			tile_size: 1.0,
		});
		assert_eq!(round_trip(packet.clone(), GAME_VERSION), packet);
	}

	#[test]
	fn chunk_reset_compresses_only_on_recent_protocols() {
		let content: Vec<u8> = std::iter::repeat(0u8).take(32 * 32 * 32).collect();
		let packet = Packet::ChunkReset(ChunkReset { tick_index: 1, chunk_id: 0, content });

		let old_protocol = build_version(0, 3, 0);
		let new_protocol = build_version(0, 3, 1);

		let uncompressed = packet.encode(old_protocol);
		let compressed = packet.encode(new_protocol);
		assert!(compressed.len() < uncompressed.len());

		assert_eq!(Packet::decode(&uncompressed, old_protocol).expect("decode"), packet);
		assert_eq!(Packet::decode(&compressed, new_protocol).expect("decode"), packet);
	}

	#[test]
	fn entities_state_update_round_trips_with_controlled_character() {
		let packet = Packet::EntitiesStateUpdate(EntitiesStateUpdate {
			tick_index: 512,
			last_input_index: 17,
			controlled_character: Some(ControlledCharacterState {
				camera_pitch: -12.5,
				camera_yaw: 145.0,
				reference_rotation: UnitQuaternion::identity(),
				position: Vector3::new(4.0, -2.0, 60.0),
			}),
			entities: vec![EntityStateData {
				entity_id: 9,
				state: EntityState {
					position: Vector3::new(1.0, 2.0, 3.0),
					rotation: UnitQuaternion::identity(),
				},
			}],
		});

		assert_eq!(round_trip(packet.clone(), GAME_VERSION), packet);
	}

	#[test]
	fn player_inputs_round_trip() {
		let packet = Packet::UpdatePlayerInputs(UpdatePlayerInputs {
			inputs: PlayerInputs {
				index: 200,
				jump: true,
				crouch: false,
				sprint: true,
				move_forward: true,
				move_backward: false,
				move_left: false,
				move_right: true,
				pitch: -3.0,
				yaw: 1.5,
			},
		});

		assert_eq!(round_trip(packet.clone(), GAME_VERSION), packet);
	}

	#[test]
	fn unknown_opcode_is_an_error() {
		assert!(matches!(
			Packet::decode(&[200, 0, 0], GAME_VERSION),
			Err(ProtocolError::UnknownOpcode(200))
		));
	}

	#[test]
	fn channel_table_matches_the_design() {
		let inputs = Packet::UpdatePlayerInputs(UpdatePlayerInputs { inputs: PlayerInputs::default() });
		assert_eq!(inputs.channel(), 1);
		assert_eq!(inputs.reliability(), PacketReliability::Unreliable);

		let reset = Packet::ChunkReset(ChunkReset { tick_index: 0, chunk_id: 0, content: vec![] });
		assert_eq!(reset.channel(), 1);
		assert_eq!(reset.reliability(), PacketReliability::Reliable);

		let state = Packet::EntitiesStateUpdate(EntitiesStateUpdate {
			tick_index: 0,
			last_input_index: 0,
			controlled_character: None,
			entities: vec![],
		});
		assert_eq!(state.channel(), 2);
		assert_eq!(state.reliability(), PacketReliability::Unreliable);
	}
}
