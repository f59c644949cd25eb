pub mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use call::{
    AssumeAvailable, Availability, CallEndpoint, CallObserver, CallState, EndReason,
    EndpointBuilder, NoopObserver, PresenceGate, PresenceTable,
};
pub use config::CallConfig;
pub use error::{CallError, CodecError, ConfigError, MediaError, SignalingError};
pub use peer::{MediaKind, SilentCapture, WebRtcGatewayFactory};
pub use session::{CallSession, Role, SessionId, UserId};
pub use signaling::{LoopbackRelay, RejectReason, SignalingChannel, WsRelay};
