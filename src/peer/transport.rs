use crate::error::Result;
use crate::media::MediaTrack;
use crate::peer::state::ConnectivityState;
use crate::peer::types::{IceCandidate, RemoteTrack, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// События транспорта в порядке поступления
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Обнаружен локальный кандидат
    Candidate(IceCandidate),
    /// Сбор кандидатов закончен (null candidate)
    GatheringComplete,
    Connectivity(ConnectivityState),
    RemoteTrack(RemoteTrack),
}

/// Абстракция над peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    /// Текущее локальное описание, включая уже собранных кандидатов
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Короткая сводка по выбранной паре кандидатов для heartbeat-а
    async fn stats_snapshot(&self) -> Option<String>;

    async fn close(&self) -> Result<()>;
}

/// Новый транспорт вместе с очередью его событий
pub struct TransportHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<TransportHandle>;
}
