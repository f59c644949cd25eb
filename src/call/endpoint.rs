//! Публичная ручка звонков одного пользователя.

use crate::call::events::{CallObserver, NoopObserver};
use crate::call::machine::{CallSessionStateMachine, Command, Input, Reply};
use crate::call::presence::{AssumeAvailable, PresenceGate};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::peer::gateway::MediaGatewayFactory;
use crate::peer::types::{MediaKind, StreamInfo};
use crate::session::{CallSession, SessionId, UserId};
use crate::signaling::channel::SignalingChannel;
use crate::signaling::messages::RejectReason;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub struct EndpointBuilder {
    config: CallConfig,
    signaling: Arc<SignalingChannel>,
    media: Arc<dyn MediaGatewayFactory>,
    presence: Arc<dyn PresenceGate>,
    observer: Arc<dyn CallObserver>,
}

impl EndpointBuilder {
    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn presence(mut self, presence: Arc<dyn PresenceGate>) -> Self {
        self.presence = presence;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Запускает автомат; нужен работающий tokio runtime
    pub fn spawn(self) -> CallEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let local_user = self.signaling.local_user().clone();
        let machine = CallSessionStateMachine::new(
            self.config,
            self.signaling,
            self.media,
            self.presence,
            self.observer,
            tx.clone(),
            snapshot_tx,
        );
        tokio::spawn(machine.run(rx));
        CallEndpoint {
            inner: Arc::new(Handle {
                local_user,
                inputs: tx,
                snapshot: snapshot_rx,
            }),
        }
    }
}

struct Handle {
    local_user: UserId,
    inputs: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<Option<CallSession>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        // автомат держит свой sender, поэтому останавливаем явно
        let _ = self.inputs.send(Input::Shutdown);
    }
}

/// Клонируемая ручка; автомат останавливается с последним клоном
#[derive(Clone)]
pub struct CallEndpoint {
    inner: Arc<Handle>,
}

impl CallEndpoint {
    pub fn builder(
        signaling: Arc<SignalingChannel>,
        media: Arc<dyn MediaGatewayFactory>,
    ) -> EndpointBuilder {
        EndpointBuilder {
            config: CallConfig::default(),
            signaling,
            media,
            presence: Arc::new(AssumeAvailable),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    pub async fn start_call(
        &self,
        peer: UserId,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        self.request(|reply| Command::Start {
            peer,
            media_kind,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_call(&self, reason: RejectReason) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reason, reply }).await
    }

    /// Повторный вызов ничего не делает
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Текущая сессия или последняя завершённая
    pub fn session(&self) -> Option<CallSession> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn local_stream(&self) -> Option<StreamInfo> {
        self.live_session().and_then(|s| s.local_stream)
    }

    pub fn remote_stream(&self) -> Option<StreamInfo> {
        self.live_session().and_then(|s| s.remote_stream)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CallSession>> {
        self.inner.snapshot.clone()
    }

    fn live_session(&self) -> Option<CallSession> {
        self.session().filter(|s| !s.is_terminal())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .inputs
            .send(Input::Command(command(reply)))
            .map_err(|_| CallError::EndpointClosed)?;
        rx.await.map_err(|_| CallError::EndpointClosed)?
    }
}
