pub mod media;
pub mod registry;
pub mod session;
pub mod transport;
pub mod webrtc_transport;

pub use media::{EncodedFrame, MediaSource, MediaStream, MediaTrack, TrackKind};
pub use registry::SessionRegistry;
pub use session::{ConnectionState, NoticeSender, PeerSession, SessionNotice, SessionParams};
pub use transport::{
    PeerRole, PeerTransport, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
pub use webrtc_transport::{create_webrtc_api, get_ice_servers, WebRtcTransportFactory};
