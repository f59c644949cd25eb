//! Состояния звонка и таблица переходов.

use crate::error::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Сессия создана, идёт проверка присутствия собеседника
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Negotiating,
    Active,
    Ended,
    Rejected,
    Failed,
    TimedOut,
    Cancelled,
}

impl CallState {
    pub const ALL: [CallState; 10] = [
        CallState::Idle,
        CallState::OutgoingRinging,
        CallState::IncomingRinging,
        CallState::Negotiating,
        CallState::Active,
        CallState::Ended,
        CallState::Rejected,
        CallState::Failed,
        CallState::TimedOut,
        CallState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Ended
                | CallState::Rejected
                | CallState::Failed
                | CallState::TimedOut
                | CallState::Cancelled
        )
    }

    /// Единственная точка, где решается допустимость перехода
    pub fn next(self, trigger: CallTrigger) -> Result<CallState, CallError> {
        use CallState::*;
        use CallTrigger::*;

        let next = match (self, trigger) {
            (Idle, PresenceAvailable) => OutgoingRinging,
            (Idle, IncomingInvite) => IncomingRinging,
            (Idle, PeerUnavailable | PeerBusy) => Rejected,

            (OutgoingRinging, RemoteAccepted) => Negotiating,
            (OutgoingRinging, RemoteRejected | PeerBusy | PeerUnavailable) => Rejected,
            (OutgoingRinging, RingTimeout) => TimedOut,
            (OutgoingRinging, MediaError) => Failed,

            (IncomingRinging, LocalAccept) => Negotiating,
            (IncomingRinging, LocalReject) => Rejected,
            (IncomingRinging, RingTimeout) => TimedOut,

            (Negotiating, MediaConnected) => Active,
            (Negotiating, MediaError | NegotiationTimeout) => Failed,

            (Active, LocalEnd | RemoteEnd | TransportLost) => Ended,
            (OutgoingRinging | IncomingRinging | Negotiating, RemoteEnd) => Ended,

            (Idle | OutgoingRinging | IncomingRinging | Negotiating, SignalingLost) => Failed,

            (Idle | OutgoingRinging | IncomingRinging | Negotiating, LocalCancel) => Cancelled,

            (state, trigger) => return Err(CallError::InvalidTransition { state, trigger }),
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Событие, которое может сдвинуть автомат
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTrigger {
    PresenceAvailable,
    IncomingInvite,
    PeerUnavailable,
    PeerBusy,
    RemoteAccepted,
    RemoteRejected,
    RingTimeout,
    LocalAccept,
    LocalReject,
    MediaConnected,
    MediaError,
    NegotiationTimeout,
    LocalEnd,
    RemoteEnd,
    TransportLost,
    SignalingLost,
    LocalCancel,
}

impl CallTrigger {
    pub const ALL: [CallTrigger; 17] = [
        CallTrigger::PresenceAvailable,
        CallTrigger::IncomingInvite,
        CallTrigger::PeerUnavailable,
        CallTrigger::PeerBusy,
        CallTrigger::RemoteAccepted,
        CallTrigger::RemoteRejected,
        CallTrigger::RingTimeout,
        CallTrigger::LocalAccept,
        CallTrigger::LocalReject,
        CallTrigger::MediaConnected,
        CallTrigger::MediaError,
        CallTrigger::NegotiationTimeout,
        CallTrigger::LocalEnd,
        CallTrigger::RemoteEnd,
        CallTrigger::TransportLost,
        CallTrigger::SignalingLost,
        CallTrigger::LocalCancel,
    ];
}

/// Причина завершения звонка. Каждая причина ведёт ровно в одно
/// терминальное состояние.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    PermissionDenied,
    DeviceUnavailable,
    NegotiationFailed,
    NegotiationTimeout,
    SignalingLost,
    PeerUnavailable,
    PeerBusy,
    Declined,
    LocalRejected,
    RingTimeout,
    RemoteEnded,
    LocalHangup,
    TransportLost,
    LocalCancelled,
    Superseded,
}

impl EndReason {
    pub fn terminal_state(self) -> CallState {
        match self {
            EndReason::PermissionDenied
            | EndReason::DeviceUnavailable
            | EndReason::NegotiationFailed
            | EndReason::NegotiationTimeout
            | EndReason::SignalingLost => CallState::Failed,
            EndReason::PeerUnavailable
            | EndReason::PeerBusy
            | EndReason::Declined
            | EndReason::LocalRejected => CallState::Rejected,
            EndReason::RingTimeout => CallState::TimedOut,
            EndReason::RemoteEnded | EndReason::LocalHangup | EndReason::TransportLost => {
                CallState::Ended
            }
            EndReason::LocalCancelled | EndReason::Superseded => CallState::Cancelled,
        }
    }

    /// Код для поля reason в call-end
    pub fn code(self) -> &'static str {
        match self {
            EndReason::PermissionDenied => "permission-denied",
            EndReason::DeviceUnavailable => "device-unavailable",
            EndReason::NegotiationFailed => "negotiation-failed",
            EndReason::NegotiationTimeout => "negotiation-timeout",
            EndReason::SignalingLost => "signaling-lost",
            EndReason::PeerUnavailable => "peer-unavailable",
            EndReason::PeerBusy => "peer-busy",
            EndReason::Declined => "declined",
            EndReason::LocalRejected => "rejected",
            EndReason::RingTimeout => "timeout",
            EndReason::RemoteEnded => "remote-ended",
            EndReason::LocalHangup => "hangup",
            EndReason::TransportLost => "transport-lost",
            EndReason::LocalCancelled => "cancelled",
            EndReason::Superseded => "superseded",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            EndReason::PermissionDenied => "Camera or microphone access was denied",
            EndReason::DeviceUnavailable => "No camera or microphone is available",
            EndReason::NegotiationFailed => "Could not establish a media connection",
            EndReason::NegotiationTimeout => "Connecting took too long",
            EndReason::SignalingLost => "Lost connection to the server",
            EndReason::PeerUnavailable => "The other person is offline",
            EndReason::PeerBusy => "The other person is on another call",
            EndReason::Declined => "The call was declined",
            EndReason::LocalRejected => "You declined the call",
            EndReason::RingTimeout => "No answer",
            EndReason::RemoteEnded => "The other person ended the call",
            EndReason::LocalHangup => "You ended the call",
            EndReason::TransportLost => "The connection was lost",
            EndReason::LocalCancelled => "Call cancelled",
            EndReason::Superseded => "Both of you called at once; joining their call",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}
