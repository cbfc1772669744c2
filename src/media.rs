use crate::error::{Result, SessionError};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(t: RTPCodecType) -> Option<Self> {
        match t {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            RTPCodecType::Unspecified => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Параметры видео захвата
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_frame_rate: u32,
    /// "user" | "environment"
    pub facing_mode: String,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        // задняя камера, 640x360 @ 15 (не больше 30)
        Self {
            width: 640,
            height: 360,
            frame_rate: 15,
            max_frame_rate: 30,
            facing_mode: "environment".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

/// Локальный трек. Клоны разделяют флаги, поэтому движок видит остановку трека
/// провайдером без владения им.
#[derive(Clone)]
pub struct MediaTrack {
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        Self {
            kind,
            rtc: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.into(),
                stream_id.into(),
            )),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Останавливает трек; повторный вызов ничего не делает
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!("Stopped local {} track {}", self.kind, self.id());
        }
    }

    /// Ссылка для привязки к транспорту
    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Пишет кадр, если трек жив и включён. Возвращает, был ли кадр отправлен.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Набор локальных треков сессии. При уничтожении все треки останавливаются,
/// так что устройство захвата не утекает ни на одном пути выхода.
#[derive(Debug, Default)]
pub struct MediaTrackSet {
    tracks: Vec<MediaTrack>,
}

impl MediaTrackSet {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Включает/выключает все треки данного типа (mute, stop video)
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        changed
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for MediaTrackSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Источник локального медиа
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Может ждать сколь угодно долго (разрешение пользователя)
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet>;

    fn release(&self, tracks: MediaTrackSet) {
        tracks.stop_all();
    }
}

/// Источник, который создаёт Opus/VP8 треки; кадры в них пишет вызывающая сторона
/// через [`MediaTrack::write_sample`].
#[derive(Debug, Default)]
pub struct SampleMediaSource;

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(SessionError::MediaAcquisition(
                "at least one of audio or video must be requested".into(),
            ));
        }

        let stream_id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "audio", stream_id.clone()));
        }
        if let Some(video) = &constraints.video {
            info!(
                "Video constraints: {}x{} @ {} fps (max {}), facing {}",
                video.width, video.height, video.frame_rate, video.max_frame_rate, video.facing_mode
            );
            tracks.push(MediaTrack::new(TrackKind::Video, "video", stream_id.clone()));
        }

        info!("Acquired {} local tracks for {}", tracks.len(), stream_id);
        Ok(MediaTrackSet::new(tracks))
    }

    fn release(&self, tracks: MediaTrackSet) {
        info!("Releasing {} local tracks", tracks.len());
        tracks.stop_all();
    }
}
