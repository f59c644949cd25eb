use crate::peer::types::{IceCandidate, MediaKind};
use crate::session::{SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Причина отказа в call-reject
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    Declined,
    Busy,
}

/// Сообщения протокола звонка. offer/answer содержат закодированный SdpPayload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    CallInvite { media_kind: MediaKind, offer: String },
    CallAccept { answer: String },
    CallReject { reason: RejectReason },
    CallCandidate { candidate: IceCandidate },
    CallEnd { reason: String },
    CallUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallInvite,
    CallAccept,
    CallReject,
    CallCandidate,
    CallEnd,
    CallUnavailable,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::CallInvite,
        SignalKind::CallAccept,
        SignalKind::CallReject,
        SignalKind::CallCandidate,
        SignalKind::CallEnd,
        SignalKind::CallUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::CallInvite => "call-invite",
            SignalKind::CallAccept => "call-accept",
            SignalKind::CallReject => "call-reject",
            SignalKind::CallCandidate => "call-candidate",
            SignalKind::CallEnd => "call-end",
            SignalKind::CallUnavailable => "call-unavailable",
        }
    }
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::CallInvite { .. } => SignalKind::CallInvite,
            SignalMessage::CallAccept { .. } => SignalKind::CallAccept,
            SignalMessage::CallReject { .. } => SignalKind::CallReject,
            SignalMessage::CallCandidate { .. } => SignalKind::CallCandidate,
            SignalMessage::CallEnd { .. } => SignalKind::CallEnd,
            SignalMessage::CallUnavailable => SignalKind::CallUnavailable,
        }
    }
}

/// Кадр, который ходит через relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub session_id: SessionId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// Порядковый номер отправителя, для дедупликации
    pub seq: u64,
    pub message: SignalMessage,
}

impl Envelope {
    pub fn kind(&self) -> SignalKind {
        self.message.kind()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
