pub mod packets;
pub mod serializer;
pub mod string_store;

pub use packets::*;
pub use serializer::{PacketReader, PacketWriter, ProtocolError};
pub use string_store::NetworkStringStore;
