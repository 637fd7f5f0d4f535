pub mod codec;
pub mod connection;
pub mod controller;
pub mod delivery;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcFactory;
pub use controller::{NegotiationController, SessionEvent};
pub use delivery::{Delivery, ManualCopy};
pub use media::{LocalTrack, MediaDevices, MediaSession, SyntheticDevices};
pub use state::SessionState;
pub use transport::{GatheringComplete, PeerTransport, TransportFactory, TransportState};
pub use types::{
    DescriptionKind, IceCandidate, MediaSummary, Role, ServerConfig, SessionDescription, TrackKind,
};
