//! In-process relay: маршрутизирует кадры между подключёнными
//! пользователями и отвечает call-unavailable, если адресата нет.

use crate::error::SignalingError;
use crate::session::UserId;
use crate::signaling::channel::{RelayEvent, RelayTransport};
use crate::signaling::messages::{Envelope, SignalKind, SignalMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Hub {
    links: HashMap<UserId, mpsc::UnboundedSender<RelayEvent>>,
    /// Пользователи, у которых связь временно "упала"
    severed: Vec<UserId>,
    log: Vec<Envelope>,
    relay_seq: u64,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Подключает пользователя; возвращает транспорт и поток входящих событий
    pub fn connect(
        &self,
        user: &UserId,
    ) -> (Arc<LoopbackLink>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub().links.insert(user.clone(), tx);
        (
            Arc::new(LoopbackLink {
                user: user.clone(),
                hub: self.hub.clone(),
            }),
            rx,
        )
    }

    /// Пользователь уходит с relay целиком
    pub fn disconnect(&self, user: &UserId) {
        if let Some(tx) = self.hub().links.remove(user) {
            let _ = tx.send(RelayEvent::Disconnected);
        }
    }

    /// Имитирует обрыв связи без отключения пользователя
    pub fn sever(&self, user: &UserId) {
        let mut hub = self.hub();
        if let Some(tx) = hub.links.get(user) {
            let _ = tx.send(RelayEvent::Disconnected);
        }
        hub.severed.push(user.clone());
    }

    pub fn restore(&self, user: &UserId) {
        let mut hub = self.hub();
        hub.severed.retain(|u| u != user);
        if let Some(tx) = hub.links.get(user) {
            let _ = tx.send(RelayEvent::Reconnected);
        }
    }

    /// Повторно доставляет уже отправленный кадр (relay с at-least-once)
    pub fn redeliver(&self, envelope: &Envelope) {
        let hub = self.hub();
        if let Some(tx) = hub.links.get(&envelope.to_user_id) {
            let _ = tx.send(RelayEvent::Frame(envelope.clone()));
        }
    }

    /// Все кадры, прошедшие через relay
    pub fn sent(&self) -> Vec<Envelope> {
        self.hub().log.clone()
    }

    pub fn sent_of(&self, kind: SignalKind) -> Vec<Envelope> {
        self.hub()
            .log
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    fn hub(&self) -> std::sync::MutexGuard<'_, Hub> {
        match self.hub.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct LoopbackLink {
    user: UserId,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl RelayTransport for LoopbackLink {
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let mut hub = match self.hub.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if hub.severed.contains(&self.user) {
            return Err(SignalingError::Disconnected);
        }
        hub.log.push(envelope.clone());

        let target = if hub.severed.contains(&envelope.to_user_id) {
            None
        } else {
            hub.links.get(&envelope.to_user_id).cloned()
        };
        match target {
            Some(tx) => {
                let _ = tx.send(RelayEvent::Frame(envelope));
            }
            None => {
                debug!(to = %envelope.to_user_id, "addressee not connected");
                // relay сам отвечает инициатору приглашения
                if envelope.kind() == SignalKind::CallInvite {
                    hub.relay_seq += 1;
                    let reply = Envelope {
                        session_id: envelope.session_id.clone(),
                        from_user_id: envelope.to_user_id.clone(),
                        to_user_id: envelope.from_user_id.clone(),
                        seq: u64::MAX - hub.relay_seq,
                        message: SignalMessage::CallUnavailable,
                    };
                    hub.log.push(reply.clone());
                    if let Some(tx) = hub.links.get(&self.user) {
                        let _ = tx.send(RelayEvent::Frame(reply));
                    }
                }
            }
        }
        Ok(())
    }
}
