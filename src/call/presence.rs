use crate::session::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Offline,
    Busy,
}

/// Внешний сервис присутствия; опрашивается до отправки приглашения
#[async_trait]
pub trait PresenceGate: Send + Sync {
    async fn is_available(&self, peer: &UserId) -> Availability;
}

/// Всех считает доступными; о недоступности тогда сообщает relay
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAvailable;

#[async_trait]
impl PresenceGate for AssumeAvailable {
    async fn is_available(&self, _peer: &UserId) -> Availability {
        Availability::Available
    }
}

/// Таблица присутствия в памяти. Неизвестные пользователи считаются Offline.
#[derive(Debug, Default, Clone)]
pub struct PresenceTable {
    entries: Arc<RwLock<HashMap<UserId, Availability>>>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user: &UserId, availability: Availability) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(user.clone(), availability);
    }
}

#[async_trait]
impl PresenceGate for PresenceTable {
    async fn is_available(&self, peer: &UserId) -> Availability {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(peer).copied().unwrap_or(Availability::Offline)
    }
}
