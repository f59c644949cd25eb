use crate::call::state::{CallState, CallTrigger};
use thiserror::Error;

/// Ошибки публичного API звонков
#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is already in progress")]
    AlreadyInCall,

    #[error("no call in progress")]
    NoSession,

    #[error("{trigger:?} is not allowed in state {state:?}")]
    InvalidTransition {
        state: CallState,
        trigger: CallTrigger,
    },

    #[error("call endpoint has shut down")]
    EndpointClosed,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Ошибки захвата устройств и медиа-транспорта
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media transport already closed")]
    Closed,
}

/// Ошибки канала сигнализации
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is disconnected")]
    Disconnected,

    #[error("relay transport error: {0}")]
    Transport(String),

    #[error("invalid signaling frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Ошибки кодирования SDP payload (json -> gzip -> base64)
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload compression failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("payload belongs to session {found}, expected {expected}")]
    SessionMismatch { expected: String, found: String },
}

/// Ошибки загрузки конфигурации
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
