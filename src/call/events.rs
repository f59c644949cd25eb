use crate::call::state::EndReason;
use crate::peer::types::MediaKind;
use crate::session::{CallSession, UserId};

/// Колбэки жизненного цикла для UI. Все методы по умолчанию пустые.
pub trait CallObserver: Send + Sync {
    /// Исходящий вызов звонит у собеседника
    fn on_ringing(&self, _session: &CallSession) {}

    fn on_incoming(&self, _caller: &UserId, _media_kind: MediaKind) {}

    fn on_connected(&self, _session: &CallSession) {}

    fn on_ended(&self, _session: &CallSession, _reason: EndReason) {}

    /// Связь с relay потеряна; p2p медиа может продолжать работать
    fn on_signaling_lost(&self) {}

    fn on_signaling_restored(&self) {}

    /// Транспорт в DISCONNECTED, идёт grace period
    fn on_media_interrupted(&self) {}

    fn on_media_recovered(&self) {}
}

/// Наблюдатель, которому ничего не нужно
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CallObserver for NoopObserver {}
