// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
    pub const DEFAULT_FILTER: &str = "ssc_call=debug,webrtc=warn";
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
    pub const DEFAULT_FILTER: &str = "ssc_call=warn";
}

/// Сколько звонит вызов до TIMED_OUT
pub const RING_TIMEOUT: Duration = Duration::from_secs(45);

/// Верхняя граница стадии NEGOTIATING
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Период ожидания перед принудительным отключением
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Дефолтные STUN серверы
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Настройки одной конечной точки звонков.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub disconnect_grace: Duration,
    /// Проигравший в glare сразу принимает встречный вызов
    pub auto_accept_on_glare: bool,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: RING_TIMEOUT,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            disconnect_grace: GRACE_PERIOD,
            auto_accept_on_glare: true,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout.is_zero() || self.negotiation_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        validate_ice_servers(&self.ice_servers)
    }
}

/// Валидация серверов (пустой url, TURN без учётных данных)
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "server {} has an empty url",
                server.id
            )));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}
