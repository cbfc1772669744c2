pub mod connection;
pub mod engine;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use engine::{EventQueue, NegotiationEngine, RemoteTrackHandler};
pub use state::{ConnectivityState, NegotiationState};
pub use transport::{PeerTransport, TransportEvent, TransportFactory, TransportHandle};
pub use types::{IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription};
