pub mod capture;
pub mod codec;
pub mod connection;
pub mod gateway;
pub mod ice;
pub mod types;

pub use capture::{CaptureBackend, LocalStream, SampleSource, SilentCapture};
pub use connection::{WebRtcGateway, WebRtcGatewayFactory};
pub use gateway::{MediaEvent, MediaEventSink, MediaGateway, MediaGatewayFactory};
pub use types::{
    IceCandidate, MediaKind, SdpKind, SdpPayload, ServerConfig, SessionDescription, StreamInfo,
    TrackKind, TransportState,
};
