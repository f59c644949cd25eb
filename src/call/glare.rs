use crate::session::UserId;

/// Исход встречных вызовов
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Остаёмся звонящим, встречное приглашение игнорируем
    KeepCaller,
    /// Отменяем свой вызов и принимаем встречный
    YieldToRemote,
}

/// Меньший идентификатор сохраняет роль звонящего.
/// Обе стороны приходят к одному решению независимо.
pub fn resolve(local: &UserId, remote: &UserId) -> GlareOutcome {
    if local <= remote {
        GlareOutcome::KeepCaller
    } else {
        GlareOutcome::YieldToRemote
    }
}
