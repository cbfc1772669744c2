#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use roomlink_lib::config::ClientConfig;
use roomlink_lib::error::{Result, SessionError};
use roomlink_lib::logger::RecordingStatusSink;
use roomlink_lib::media::{MediaConstraints, MediaSource, MediaTrack, MediaTrackSet, TrackKind};
use roomlink_lib::monitor::KeepAwake;
use roomlink_lib::peer::{
    ConnectivityState, IceCandidate, PeerTransport, SessionDescription, TransportEvent,
    TransportFactory, TransportHandle,
};
use roomlink_lib::session::{Collaborators, SessionController};
use roomlink_lib::signaling::{SignalingChannel, SignalingConnector};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Медиа-источник, считающий выдачи и возвраты
#[derive(Default)]
pub struct MockMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    /// Сколько треков ещё было живо в момент каждого acquire
    pub live_at_acquire: Mutex<Vec<usize>>,
    tracks: Mutex<Vec<MediaTrack>>,
    gate: Option<Arc<Notify>>,
    pub started: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockMedia {
    /// acquire ждёт, пока тест не откроет `gate`
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    pub fn live_at_acquire(&self) -> Vec<usize> {
        self.live_at_acquire.lock().unwrap().clone()
    }

    /// Все видеотреки, выданные последним acquire
    pub fn latest_video(&self) -> Vec<MediaTrack> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|t| t.kind() == TrackKind::Video)
            .take(1)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaTrackSet> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.live_at_acquire
            .lock()
            .unwrap()
            .push(self.live_tracks());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::MediaAcquisition("permission denied".into()));
        }

        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = format!("mock-{n}");
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, format!("audio-{n}"), &stream));
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(TrackKind::Video, format!("video-{n}"), &stream));
        }
        self.tracks.lock().unwrap().extend(tracks.iter().cloned());
        Ok(MediaTrackSet::new(tracks))
    }

    fn release(&self, tracks: MediaTrackSet) {
        self.released.fetch_add(1, Ordering::SeqCst);
        tracks.stop_all();
    }
}

/// Транспорт без сети: после set_local_description сразу выдаёт
/// одного кандидата и конец сбора
pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub closed: AtomicBool,
    pub tracks: AtomicUsize,
    close_delay: Duration,
}

impl MockTransport {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn connectivity(&self, state: ConnectivityState) {
        self.emit(TransportEvent::Connectivity(state));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, _track: &MediaTrack) -> Result<()> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc.clone());
        self.emit(TransportEvent::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        self.emit(TransportEvent::GatheringComplete);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone().map(|d| {
            SessionDescription::offer(format!(
                "{}a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n",
                d.sdp
            ))
        })
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.remote.lock().unwrap().push(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn stats_snapshot(&self) -> Option<String> {
        Some("mock-pair".into())
    }

    async fn close(&self) -> Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
    close_delay: Mutex<Duration>,
}

impl MockTransportFactory {
    /// Транспорты, созданные после вызова, закрываются с задержкой
    pub fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn live(&self) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !t.is_closed())
            .count()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self) -> Result<TransportHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            events: tx,
            local: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            tracks: AtomicUsize::new(0),
            close_delay: *self.close_delay.lock().unwrap(),
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(TransportHandle {
            transport,
            events: rx,
        })
    }
}

/// Relay в памяти: запоминает всё отправленное клиентом
#[derive(Default)]
pub struct MockConnector {
    sent: Arc<Mutex<Vec<String>>>,
    to_client: Mutex<Vec<Option<mpsc::UnboundedSender<String>>>>,
    pub fail: AtomicBool,
}

impl MockConnector {
    pub fn opened(&self) -> usize {
        self.to_client.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    pub fn sent_cmd(&self, cmd: &str) -> usize {
        self.sent().iter().filter(|v| v["cmd"] == cmd).count()
    }

    /// Сообщение клиенту по последнему открытому каналу
    pub fn reply(&self, text: impl Into<String>) {
        if let Some(Some(tx)) = self.to_client.lock().unwrap().last() {
            let _ = tx.send(text.into());
        }
    }

    /// Relay закрывает последний открытый канал
    pub fn close_relay(&self) {
        if let Some(slot) = self.to_client.lock().unwrap().last_mut() {
            slot.take();
        }
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn open(&self, _url: &str) -> Result<SignalingChannel> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Signaling("relay unreachable".into()));
        }
        let (channel, mut relay) = SignalingChannel::pair();
        let sent = self.sent.clone();
        tokio::spawn(async move {
            while let Some(text) = relay.from_client.recv().await {
                sent.lock().unwrap().push(text);
            }
        });
        self.to_client.lock().unwrap().push(Some(relay.to_client));
        Ok(channel)
    }
}

pub struct Harness {
    pub controller: Arc<SessionController>,
    pub media: Arc<MockMedia>,
    pub transports: Arc<MockTransportFactory>,
    pub relay: Arc<MockConnector>,
    pub status: Arc<RecordingStatusSink>,
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        signaling_url: "ws://relay.test/ws".into(),
        user_id: "123456".into(),
        gathering_timeout_ms: 1_000,
        heartbeat_interval_ms: 20,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(MockMedia::default(), test_config())
}

pub fn harness_with(media: MockMedia, config: ClientConfig) -> Harness {
    build_harness(media, config, None)
}

pub fn build_harness(
    media: MockMedia,
    config: ClientConfig,
    keep_awake: Option<Arc<dyn KeepAwake>>,
) -> Harness {
    let media = Arc::new(media);
    let transports = Arc::new(MockTransportFactory::default());
    let relay = Arc::new(MockConnector::default());
    let status = Arc::new(RecordingStatusSink::default());
    let mut deps = Collaborators::new(
        media.clone(),
        transports.clone(),
        relay.clone(),
        status.clone(),
    );
    if let Some(keep_awake) = keep_awake {
        deps = deps.with_keep_awake(keep_awake);
    }
    let controller = SessionController::new(config, deps);
    Harness {
        controller,
        media,
        transports,
        relay,
        status,
    }
}

/// Считает захваты и освобождения ресурса "не засыпать"
#[derive(Default)]
pub struct CountingKeepAwake {
    pub held: AtomicUsize,
    pub acquired: AtomicUsize,
}

#[async_trait]
impl KeepAwake for CountingKeepAwake {
    async fn acquire(&self) -> Result<()> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ответ relay в формате сервера
pub fn answer_message(sdp: &str) -> String {
    let desc = serde_json::json!({ "type": "answer", "sdp": sdp });
    let encoded = general_purpose::STANDARD.encode(desc.to_string());
    serde_json::json!({ "type": "answer", "answer": encoded }).to_string()
}

pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Даёт фоновым задачам отработать
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
