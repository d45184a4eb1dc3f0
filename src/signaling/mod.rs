mod channel;
mod message;
mod relay_client;

pub use channel::{SignalHub, SignalingChannel, Subscription};
pub use message::{
    topic_for, IceCandidate, SdpKind, SessionDescription, SignalEnvelope, SignalKind,
    SignalingMessage, SIGNAL_EVENT,
};
pub use relay_client::RelayChannel;
