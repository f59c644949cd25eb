pub mod channel;
pub mod loopback;
pub mod messages;
pub mod ws;

pub use channel::{LinkStatus, RelayEvent, RelayTransport, SignalingChannel, Subscription};
pub use loopback::{LoopbackLink, LoopbackRelay};
pub use messages::{Envelope, RejectReason, SignalKind, SignalMessage};
pub use ws::WsRelay;
