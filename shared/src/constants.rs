use std::time::Duration;

// Tick constants
pub const TICK_RATE: u32 = 30;
pub const TICK_DURATION: Duration = Duration::from_nanos(1_000_000_000 / TICK_RATE as u64);
pub const SAVE_INTERVAL: Duration = Duration::from_secs(30);

// Chat constants
pub const CHAT_MAX_LINES: usize = 100;
pub const CHAT_MAX_MESSAGE_LENGTH: usize = 1024;
pub const CHAT_MAX_PLAYER_MESSAGE_LENGTH: usize = 256;

// Player constants
pub const PLAYER_MAX_NICKNAME_LENGTH: usize = 16;
pub const PLAYER_COLLIDER_RADIUS: f32 = 0.3;
pub const PLAYER_COLLIDER_HEIGHT: f32 = 1.85;
pub const PLAYER_EYES_HEIGHT: f32 = 1.75;
pub const PLAYER_FLY_SPEED: f32 = 20.0;
pub const PLAYER_JUMP_POWER: f32 = 5.0;
pub const PLAYER_SPRINT_SPEED: f32 = 8.0;
pub const PLAYER_WALK_SPEED: f32 = 5.0;

/// Degrees per second the reference frame may rotate to realign with gravity.
pub const GRAVITY_MAX_ROTATION_SPEED: f32 = 180.0;
/// Degrees per second of camera rotation a single input may carry.
pub const PLAYER_ROTATION_SPEED: f32 = 90.0;

// Computed constants
pub const PLAYER_CAPSULE_HEIGHT: f32 = PLAYER_COLLIDER_HEIGHT - PLAYER_COLLIDER_RADIUS * 2.0;
pub const PLAYER_CAMERA_HEIGHT: f32 = PLAYER_EYES_HEIGHT - PLAYER_COLLIDER_HEIGHT * 0.5;

// Network constants
pub const NETWORK_CHANNEL_COUNT: u8 = 3;
pub const MAX_CONCURRENT_CHUNK_UPDATE: usize = 3;
pub const PACKET_LENGTH_LIMIT: usize = 4 * 1024 * 1024;

// Chunk constants
pub const CHUNK_SIZE: u32 = 32;
pub const CHUNK_BINARY_VERSION: u32 = 1;
pub const SAVE_DIRECTORY: &str = "saves/chunks";
