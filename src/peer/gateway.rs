//! Граница между автоматом звонка и медиа-транспортом.

use crate::error::MediaError;
use crate::peer::capture::LocalStream;
use crate::peer::types::{IceCandidate, MediaKind, SessionDescription, StreamInfo, TransportState};
use crate::session::SessionId;
use async_trait::async_trait;
use std::sync::Arc;

/// Асинхронные уведомления транспорта
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Trickle ICE: очередной локальный кандидат
    LocalCandidate(IceCandidate),
    /// Сбор кандидатов завершён
    GatheringComplete,
    StateChanged(TransportState),
    RemoteStream(StreamInfo),
}

/// Куда транспорт отдаёт свои события; привязан к одной сессии
#[derive(Clone)]
pub struct MediaEventSink {
    session_id: SessionId,
    emit: Arc<dyn Fn(SessionId, MediaEvent) + Send + Sync>,
}

impl MediaEventSink {
    pub fn new(
        session_id: SessionId,
        emit: impl Fn(SessionId, MediaEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            session_id,
            emit: Arc::new(emit),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn emit(&self, event: MediaEvent) {
        (self.emit)(self.session_id.clone(), event);
    }
}

/// Один p2p медиа-транспорт на одну сессию
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Захватывает устройства и подключает треки к транспорту
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalStream, MediaError>;

    /// Создаёт offer и запускает сбор кандидатов
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Применяет удалённый offer и создаёт answer
    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// Плохой кандидат логируется и пропускается, звонок не рвётся
    async fn add_remote_candidate(&self, candidate: IceCandidate);

    fn remote_stream(&self) -> Option<StreamInfo>;

    /// Идемпотентно
    async fn close(&self);
}

#[async_trait]
pub trait MediaGatewayFactory: Send + Sync {
    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaGateway>, MediaError>;
}
