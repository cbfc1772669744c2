use thiserror::Error;

/// Ошибки сессии. Варианты соответствуют политике восстановления:
/// `Validation` и `MediaAcquisition` прерывают попытку входа,
/// `ProtocolDecode` логируется и игнорируется, `OutOfOrder` ведёт к rejoin.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid room name: {0}")]
    Validation(String),

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("malformed signaling payload: {0}")]
    ProtocolDecode(String),

    #[error("negotiation out of order: {0}")]
    OutOfOrder(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cancelled before the session was established")]
    Cancelled,

    #[error("signaling channel error: {0}")]
    Signaling(String),

    #[error("peer transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("room directory error: {0}")]
    Directory(#[from] reqwest::Error),
}

impl SessionError {
    /// Ошибка, после которой сессию нужно пересоздать
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SessionError::OutOfOrder(_))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::ProtocolDecode(e.to_string())
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(e: base64::DecodeError) -> Self {
        SessionError::ProtocolDecode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Signaling(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
