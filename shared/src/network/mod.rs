pub mod reactor;
pub mod session;

pub use reactor::{
	DisconnectionType, IncomingEvent, NetworkReactor, OutgoingCommand, OutgoingEvent, PeerId, PeerInfo, ReactorError,
	SendCommand, INVALID_PEER_ID,
};
pub use session::NetworkSession;
