use crate::call::state::{CallState, EndReason};
use crate::peer::ice::PendingCandidates;
use crate::peer::types::{MediaKind, StreamInfo};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Идентификатор пользователя; порядок используется для разрешения glare
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Идентификатор попытки звонка, генерируется инициатором
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

/// Одна попытка звонка. Живёт до терминального состояния, затем
/// остаётся только снимком для UI.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: Role,
    pub peer: UserId,
    pub media_kind: MediaKind,
    pub state: CallState,
    pub local_stream: Option<StreamInfo>,
    pub remote_stream: Option<StreamInfo>,
    pub pending_remote_candidates: PendingCandidates,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn new(session_id: SessionId, role: Role, peer: UserId, media_kind: MediaKind) -> Self {
        Self {
            session_id,
            role,
            peer,
            media_kind,
            state: CallState::Idle,
            local_stream: None,
            remote_stream: None,
            pending_remote_candidates: PendingCandidates::default(),
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// connected_at ставится только один раз
    pub fn mark_connected(&mut self) -> bool {
        if self.connected_at.is_some() {
            return false;
        }
        self.connected_at = Some(Utc::now());
        true
    }

    pub fn mark_ended(&mut self, state: CallState, reason: EndReason) {
        self.state = state;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_at_is_set_once() {
        let mut session = CallSession::new(
            SessionId::generate(),
            Role::Caller,
            UserId::new("bob"),
            MediaKind::Audio,
        );
        assert!(session.mark_connected());
        let first = session.connected_at;
        assert!(!session.mark_connected());
        assert_eq!(session.connected_at, first);
    }

    #[test]
    fn user_ids_are_totally_ordered() {
        assert!(UserId::new("alice") < UserId::new("bob"));
        assert!(UserId::new("user-10") < UserId::new("user-9"));
    }
}
