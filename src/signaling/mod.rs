pub mod channel;
pub mod message;
pub mod rooms;

pub use channel::{RelayEnd, SignalingChannel, SignalingConnector, WsConnector};
pub use message::{decode_description, encode_description, Role, SignalingMessage};
pub use rooms::{RoomDirectory, RoomInfo};
