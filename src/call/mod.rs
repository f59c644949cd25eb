pub mod endpoint;
pub mod events;
pub mod glare;
pub mod machine;
pub mod presence;
pub mod state;

pub use endpoint::{CallEndpoint, EndpointBuilder};
pub use events::{CallObserver, NoopObserver};
pub use glare::GlareOutcome;
pub use presence::{AssumeAvailable, Availability, PresenceGate, PresenceTable};
pub use state::{CallState, CallTrigger, EndReason};
