// Конфигурация клиента
// Логирование по умолчанию включено только в режиме разработки

use crate::error::{Result, SessionError};
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use crate::utils::random_id;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене включается через ROOMLINK_LOG=1

pub const ENV_LOG: &str = "ROOMLINK_LOG";
pub const ENV_SIGNALING_URL: &str = "ROOMLINK_SIGNALING_URL";
pub const ENV_ROOMS_URL: &str = "ROOMLINK_ROOMS_URL";
pub const ENV_USER_ID: &str = "ROOMLINK_USER_ID";

/// Сколько ждать окончания сбора кандидатов перед отправкой offer
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Период heartbeat-а в состоянии connected
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![ServerConfig {
        id: "default-stun".into(),
        r#type: "stun".into(),
        url: "stun:stun.l.google.com:19302".into(),
        username: None,
        credential: None,
    }]
});

pub fn logging_enabled() -> bool {
    match std::env::var(ENV_LOG) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "on"),
        Err(_) => LOGGING_ENABLED,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket relay, например `wss://host/ws`
    pub signaling_url: String,
    /// HTTP список комнат, например `https://host/api/confInfo`
    pub rooms_url: String,
    pub user_id: String,
    pub ice_servers: Vec<ServerConfig>,
    pub gathering_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub media: MediaConstraints,
    /// Зритель (join) гасит своё видео, как только пришло видео комнаты
    pub mute_local_video_on_remote: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://localhost:9443/ws".into(),
            rooms_url: "https://localhost:9443/api/confInfo".into(),
            user_id: random_id(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            gathering_timeout_ms: DEFAULT_GATHERING_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            media: MediaConstraints::default(),
            mute_local_video_on_remote: true,
        }
    }
}

impl ClientConfig {
    /// Файл (если задан) → переменные окружения → валидация
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    SessionError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        info!(
            "Config loaded: signaling={}, rooms={}, user={}, {} ICE servers",
            config.signaling_url,
            config.rooms_url,
            config.user_id,
            config.ice_servers.len()
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SessionError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_SIGNALING_URL) {
            self.signaling_url = url;
        }
        if let Ok(url) = std::env::var(ENV_ROOMS_URL) {
            self.rooms_url = url;
        }
        if let Ok(id) = std::env::var(ENV_USER_ID) {
            self.user_id = id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://"))
        {
            return Err(SessionError::Config(format!(
                "signaling url must be ws:// or wss://, got '{}'",
                self.signaling_url
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(SessionError::Config("user id cannot be empty".into()));
        }
        if self.gathering_timeout_ms == 0 {
            return Err(SessionError::Config(
                "gathering timeout must be positive".into(),
            ));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(SessionError::Config("Server URL cannot be empty".into()));
            }
            if server.r#type == "turn"
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SessionError::Config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
