//! Адаптер канала сигнализации.
//!
//! Держит регистрацию обработчиков, нумерует исходящие кадры и
//! отбрасывает повторную доставку входящих.

use crate::error::SignalingError;
use crate::session::{SessionId, UserId};
use crate::signaling::messages::{Envelope, SignalKind, SignalMessage};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Событие от relay-транспорта
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Frame(Envelope),
    Disconnected,
    Reconnected,
}

/// Физическая связь с relay (WebSocket, loopback)
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;
}

/// Состояние связи с relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Lost,
    Restored,
}

type FrameHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(LinkStatus) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    frames: HashMap<SignalKind, Vec<(u64, FrameHandler)>>,
    status: Vec<(u64, StatusHandler)>,
}

/// Окно дедупликации по (отправитель, сессия, seq)
struct DedupWindow {
    seen: HashSet<(UserId, SessionId, u64)>,
    order: VecDeque<(UserId, SessionId, u64)>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// true, если кадр новый
    fn admit(&mut self, envelope: &Envelope) -> bool {
        let key = (
            envelope.from_user_id.clone(),
            envelope.session_id.clone(),
            envelope.seq,
        );
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

const DEDUP_CAPACITY: usize = 1024;

pub struct SignalingChannel {
    local_user: UserId,
    transport: Arc<dyn RelayTransport>,
    handlers: Mutex<Handlers>,
    dedup: Mutex<DedupWindow>,
    next_seq: AtomicU64,
    connected: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Запускает разбор входящих событий транспорта
    pub fn start(
        local_user: UserId,
        transport: Arc<dyn RelayTransport>,
        mut inbound: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            local_user,
            transport,
            handlers: Mutex::new(Handlers::default()),
            dedup: Mutex::new(DedupWindow::new(DEDUP_CAPACITY)),
            next_seq: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&channel);
        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(channel) = weak.upgrade() else { break };
                channel.dispatch(event);
            }
            if let Some(channel) = weak.upgrade() {
                channel.dispatch(RelayEvent::Disconnected);
            }
        });
        *lock(&channel.pump) = Some(pump);
        channel
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(
        &self,
        session_id: &SessionId,
        message: SignalMessage,
        to: &UserId,
    ) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }
        let envelope = Envelope {
            session_id: session_id.clone(),
            from_user_id: self.local_user.clone(),
            to_user_id: to.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            message,
        };
        debug!(kind = envelope.kind().as_str(), session = %session_id, to = %to, "signal out");
        self.transport.send(envelope).await
    }

    /// Подписка на тип сообщения. Обработчик живёт, пока жива Subscription.
    pub fn on(
        self: &Arc<Self>,
        kind: SignalKind,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        let mut handlers = lock(&self.handlers);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers
            .frames
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            channel: Arc::downgrade(self),
            id,
            kind: Some(kind),
        }
    }

    pub fn on_status(
        self: &Arc<Self>,
        handler: impl Fn(LinkStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let mut handlers = lock(&self.handlers);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.status.push((id, Arc::new(handler)));
        Subscription {
            channel: Arc::downgrade(self),
            id,
            kind: None,
        }
    }

    pub fn handler_count(&self) -> usize {
        let handlers = lock(&self.handlers);
        handlers.frames.values().map(Vec::len).sum::<usize>() + handlers.status.len()
    }

    fn unsubscribe(&self, id: u64, kind: Option<SignalKind>) {
        let mut handlers = lock(&self.handlers);
        match kind {
            Some(kind) => {
                if let Some(list) = handlers.frames.get_mut(&kind) {
                    list.retain(|(hid, _)| *hid != id);
                }
            }
            None => handlers.status.retain(|(hid, _)| *hid != id),
        }
    }

    fn dispatch(&self, event: RelayEvent) {
        match event {
            RelayEvent::Frame(envelope) => {
                if envelope.to_user_id != self.local_user {
                    warn!(to = %envelope.to_user_id, "frame addressed to another user dropped");
                    return;
                }
                if !lock(&self.dedup).admit(&envelope) {
                    trace!(seq = envelope.seq, session = %envelope.session_id, "duplicate frame dropped");
                    return;
                }
                debug!(kind = envelope.kind().as_str(), session = %envelope.session_id, from = %envelope.from_user_id, "signal in");
                // обработчики вызываются без удержания блокировки
                let targets: Vec<FrameHandler> = lock(&self.handlers)
                    .frames
                    .get(&envelope.kind())
                    .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();
                for handler in targets {
                    handler(&envelope);
                }
            }
            RelayEvent::Disconnected => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!("signaling channel lost");
                    self.notify_status(LinkStatus::Lost);
                }
            }
            RelayEvent::Reconnected => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!("signaling channel restored");
                    self.notify_status(LinkStatus::Restored);
                }
            }
        }
    }

    fn notify_status(&self, status: LinkStatus) {
        let targets: Vec<StatusHandler> = lock(&self.handlers)
            .status
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in targets {
            handler(status);
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

/// Снимает обработчик при drop
pub struct Subscription {
    channel: Weak<SignalingChannel>,
    id: u64,
    kind: Option<SignalKind>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsubscribe(self.id, self.kind);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
