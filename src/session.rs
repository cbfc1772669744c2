use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::logger::{Severity, StatusSink};
use crate::media::{MediaSource, MediaTrack, MediaTrackSet, TrackKind};
use crate::monitor::{
    ConnectivityMonitor, KeepAwake, NoKeepAwake, RecoveryReason, STATUS_RELAY_CLOSED,
};
use crate::peer::engine::{EventQueue, NegotiationEngine, RemoteTrackHandler};
use crate::peer::state::{ConnectivityState, NegotiationState};
use crate::peer::transport::{TransportEvent, TransportFactory};
use crate::peer::types::RemoteTrack;
use crate::signaling::{Role, SignalingChannel, SignalingConnector, SignalingMessage};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Внешние зависимости контроллера
pub struct Collaborators {
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub status: Arc<dyn StatusSink>,
    pub keep_awake: Arc<dyn KeepAwake>,
}

impl Collaborators {
    pub fn new(
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingConnector>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            media,
            transports,
            signaling,
            status,
            keep_awake: Arc::new(NoKeepAwake),
        }
    }

    pub fn with_keep_awake(mut self, keep_awake: Arc<dyn KeepAwake>) -> Self {
        self.keep_awake = keep_awake;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Rejoining,
    Active,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => f.write_str("idle"),
            SessionPhase::Joining => f.write_str("joining"),
            SessionPhase::Rejoining => f.write_str("rejoining"),
            SessionPhase::Active => f.write_str("active"),
        }
    }
}

/// Имя комнаты без пробелов по краям; пустое имя не принимается
pub fn validate_room_name(room_name: &str) -> Result<String> {
    let room = room_name.trim();
    if room.is_empty() {
        return Err(SessionError::Validation("room name is empty".into()));
    }
    Ok(room.to_owned())
}

/// Флаг "уже выполняется", снимается при выходе из области видимости
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// То, что разделяют цикл сессии и контроллер
#[derive(Clone)]
struct SessionLink {
    generation: u64,
    engine: Arc<Mutex<NegotiationEngine>>,
    monitor: Arc<Mutex<ConnectivityMonitor>>,
    status: Arc<dyn StatusSink>,
}

impl SessionLink {
    async fn handle_inbound(&self, text: &str) -> Result<()> {
        let msg = match SignalingMessage::decode(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Ignoring malformed signaling payload: {e}");
                self.status
                    .notify(&format!("信令消息无法解析：{e}"), Severity::Error);
                return Err(e);
            }
        };

        match msg {
            SignalingMessage::Answer { answer } => {
                let result = self
                    .engine
                    .lock()
                    .await
                    .apply_remote_description(&answer)
                    .await;
                if let Err(e) = &result {
                    if e.is_session_fatal() {
                        warn!("Session #{} cannot continue: {e}", self.generation);
                        self.monitor.lock().await.escalate(e.to_string());
                    } else {
                        warn!("Failed to apply answer: {e}");
                        self.status
                            .notify(&format!("无法应用应答：{e}"), Severity::Error);
                    }
                }
                result
            }
            other => {
                debug!("Ignoring '{}' message from relay", other.tag());
                Ok(())
            }
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        let connectivity = self.engine.lock().await.handle_event(event);
        if let Some(state) = connectivity {
            self.monitor.lock().await.observe(state).await;
        }
    }
}

/// Один цикл на сессию: входящие сообщения relay и события транспорта
async fn pump(
    link: SessionLink,
    mut inbound: mpsc::UnboundedReceiver<String>,
    mut events: EventQueue,
) {
    let mut relay_open = true;
    loop {
        tokio::select! {
            msg = inbound.recv(), if relay_open => match msg {
                Some(text) => {
                    let _ = link.handle_inbound(&text).await;
                }
                None => {
                    warn!("Relay closed the signaling channel of session #{}", link.generation);
                    link.status.notify(STATUS_RELAY_CLOSED, Severity::Error);
                    relay_open = false;
                }
            },
            event = events.next() => match event {
                Some(event) => link.handle_event(event).await,
                None => break,
            },
        }
    }
    debug!("Session #{} pump finished", link.generation);
}

struct ActiveSession {
    room: String,
    role: Role,
    tracks: Option<MediaTrackSet>,
    link: SessionLink,
    channel: SignalingChannel,
    pump: Option<JoinHandle<()>>,
}

/// Промежуточные ресурсы входа: всё, что нужно закрыть при неудаче
#[derive(Default)]
struct Staged {
    tracks: Option<MediaTrackSet>,
    engine: Option<NegotiationEngine>,
    channel: Option<SignalingChannel>,
}

struct Negotiated {
    inbound: mpsc::UnboundedReceiver<String>,
    events: EventQueue,
}

/// Сессия в комнате: вход, восстановление и выход.
///
/// Держит не больше одной активной сессии (один движок и один набор треков).
/// `rejoin` выполняется в единственном экземпляре, конкурирующие вызовы
/// отбрасываются.
pub struct SessionController {
    me: Weak<SessionController>,
    config: ClientConfig,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingConnector>,
    status: Arc<dyn StatusSink>,
    keep_awake: Arc<dyn KeepAwake>,
    active: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    joining: AtomicBool,
    rejoining: AtomicBool,
    // каждое `leave` увеличивает эпоху и отменяет незавершённый вход
    cancel: watch::Sender<u64>,
    remote_track_handler: std::sync::Mutex<Option<RemoteTrackHandler>>,
}

impl SessionController {
    pub fn new(config: ClientConfig, deps: Collaborators) -> Arc<Self> {
        let (cancel, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            media: deps.media,
            transports: deps.transports,
            signaling: deps.signaling,
            status: deps.status,
            keep_awake: deps.keep_awake,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            joining: AtomicBool::new(false),
            rejoining: AtomicBool::new(false),
            cancel,
            remote_track_handler: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Обработчик входящих треков для всех последующих сессий
    pub fn on_remote_track(&self, handler: RemoteTrackHandler) {
        if let Ok(mut slot) = self.remote_track_handler.lock() {
            *slot = Some(handler);
        }
    }

    pub async fn join(&self, room_name: &str, role: Role) -> Result<()> {
        let room = validate_room_name(room_name)?;
        let Some(_joining) = InFlight::try_acquire(&self.joining) else {
            return Err(SessionError::InvalidState(
                "another join is already in progress".into(),
            ));
        };
        if let Some(current) = self.active.lock().await.as_ref() {
            return Err(SessionError::InvalidState(format!(
                "already in room '{}'",
                current.room
            )));
        }

        info!("Joining room '{room}' as {role}");
        let epoch = *self.cancel.borrow();
        let result = self.establish(room, role, epoch).await;
        if let Err(e) = &result {
            self.report_failure("加入房间失败", e);
        }
        result
    }

    /// Пересоздаёт текущую сессию с тем же именем комнаты и ролью.
    /// Возвращает `false`, если делать нечего или rejoin уже идёт.
    pub async fn rejoin(&self) -> Result<bool> {
        self.rejoin_generation(None).await
    }

    async fn rejoin_generation(&self, expected: Option<u64>) -> Result<bool> {
        let Some(_rejoining) = InFlight::try_acquire(&self.rejoining) else {
            debug!("Rejoin already in flight, dropping request");
            return Ok(false);
        };
        let Some(_joining) = InFlight::try_acquire(&self.joining) else {
            debug!("Join in flight, dropping rejoin request");
            if let Some(generation) = expected {
                self.rearm_recovery(generation).await;
            }
            return Ok(false);
        };

        // эпоха читается вместе с изъятием сессии: `leave` во время retire
        // отменяет новый вход
        let (retired, epoch) = {
            let mut active = self.active.lock().await;
            let current = active.as_ref().map(|s| s.link.generation);
            match current {
                None => {
                    debug!("No session to rejoin");
                    return Ok(false);
                }
                Some(g) if expected.is_some_and(|e| e != g) => {
                    debug!("Stale recovery request for session #{g}");
                    return Ok(false);
                }
                Some(_) => (active.take(), *self.cancel.borrow()),
            }
        };
        let Some(session) = retired else {
            return Ok(false);
        };

        let (room, role) = (session.room.clone(), session.role);
        info!(
            "Rejoining room '{room}' as {role} (retiring session #{})",
            session.link.generation
        );
        self.retire(session).await;

        match self.establish(room, role, epoch).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.report_failure("重新连接失败", &e);
                Err(e)
            }
        }
    }

    /// Отменяет незавершённый вход и закрывает текущую сессию
    pub async fn leave(&self) {
        let session = {
            let mut active = self.active.lock().await;
            self.cancel.send_modify(|epoch| *epoch += 1);
            active.take()
        };
        if let Some(session) = session {
            info!("Leaving room '{}'", session.room);
            self.retire(session).await;
        }
    }

    /// Обработка входящего сообщения relay текущей сессией
    pub async fn handle_inbound(&self, text: &str) -> Result<()> {
        let link = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|s| s.link.clone())
            .ok_or_else(|| SessionError::InvalidState("no active session".into()))?;
        link.handle_inbound(text).await
    }

    pub async fn send_control(&self, detail: &str) -> Result<()> {
        let active = self.active.lock().await;
        let session = active
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState("no active session".into()))?;
        session.channel.send(&SignalingMessage::Control {
            room_name: session.room.clone(),
            user_id: self.config.user_id.clone(),
            detail: detail.to_owned(),
        })
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<usize> {
        self.set_enabled(TrackKind::Audio, enabled).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<usize> {
        self.set_enabled(TrackKind::Video, enabled).await
    }

    async fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Result<usize> {
        let active = self.active.lock().await;
        let tracks = active
            .as_ref()
            .and_then(|s| s.tracks.as_ref())
            .ok_or_else(|| SessionError::InvalidState("no active session".into()))?;
        let changed = tracks.set_enabled(kind, enabled);
        info!("Local {kind} {} ({changed} tracks)", if enabled { "on" } else { "off" });
        Ok(changed)
    }

    pub async fn state(&self) -> SessionPhase {
        if self.rejoining.load(Ordering::SeqCst) {
            SessionPhase::Rejoining
        } else if self.joining.load(Ordering::SeqCst) {
            SessionPhase::Joining
        } else if self.active.lock().await.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::Idle
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn room(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.room.clone())
    }

    pub async fn generation(&self) -> Option<u64> {
        self.active.lock().await.as_ref().map(|s| s.link.generation)
    }

    pub async fn negotiation_state(&self) -> Option<NegotiationState> {
        let link = self.active.lock().await.as_ref().map(|s| s.link.clone())?;
        let state = link.engine.lock().await.state();
        Some(state)
    }

    pub async fn connectivity_state(&self) -> Option<ConnectivityState> {
        let link = self.active.lock().await.as_ref().map(|s| s.link.clone())?;
        let state = link.monitor.lock().await.state();
        Some(state)
    }

    pub async fn live_track_count(&self) -> usize {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.tracks.as_ref())
            .map_or(0, |t| t.live_count())
    }

    /// Медиа → транспорт → канал → offer → отправка → цикл сессии
    async fn establish(&self, room: String, role: Role, epoch: u64) -> Result<()> {
        let tracks = self.acquire_media(epoch).await?;

        let mut staged = Staged {
            tracks: Some(tracks),
            ..Default::default()
        };
        let negotiated = match self.negotiate(&room, role, &mut staged, epoch).await {
            Ok(n) => n,
            Err(e) => {
                self.abandon(staged).await;
                return Err(e);
            }
        };

        let mut active = self.active.lock().await;
        if *self.cancel.borrow() != epoch || active.is_some() {
            drop(active);
            self.abandon(staged).await;
            return Err(SessionError::Cancelled);
        }
        let (engine, channel) = match (staged.engine.take(), staged.channel.take()) {
            (Some(engine), Some(channel)) => (engine, channel),
            (engine, channel) => {
                drop(active);
                staged.engine = engine;
                staged.channel = channel;
                self.abandon(staged).await;
                return Err(SessionError::InvalidState("session was not fully staged".into()));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let monitor = self.monitor_for(generation, &engine);
        let link = SessionLink {
            generation,
            engine: Arc::new(Mutex::new(engine)),
            monitor: Arc::new(Mutex::new(monitor)),
            status: self.status.clone(),
        };
        let pump = tokio::spawn(pump(link.clone(), negotiated.inbound, negotiated.events));

        *active = Some(ActiveSession {
            room,
            role,
            tracks: staged.tracks.take(),
            link,
            channel,
            pump: Some(pump),
        });
        info!("Session #{generation} established");
        Ok(())
    }

    async fn negotiate(
        &self,
        room: &str,
        role: Role,
        staged: &mut Staged,
        epoch: u64,
    ) -> Result<Negotiated> {
        let handle = self.transports.create().await?;
        let engine = staged.engine.insert(NegotiationEngine::new(handle));
        if let Some(tracks) = &staged.tracks {
            engine.attach_local_tracks(tracks).await?;
            engine.on_remote_track(self.remote_track_handler_for(role, tracks));
        }

        let channel = self.signaling.open(&self.config.signaling_url).await?;
        let channel = staged.channel.insert(channel);
        self.ensure_not_cancelled(epoch)?;

        let offer = engine.create_offer().await?;
        engine.commit_local_description(&offer).await?;
        let finalized = engine
            .await_finalized(self.config.gathering_timeout())
            .await?;
        self.ensure_not_cancelled(epoch)?;

        channel.send(&SignalingMessage::offer(
            role,
            room,
            &self.config.user_id,
            finalized,
        ))?;

        let inbound = channel
            .take_inbound()
            .ok_or_else(|| SessionError::InvalidState("signaling inbound already taken".into()))?;
        let events = engine
            .take_event_queue()
            .ok_or_else(|| SessionError::InvalidState("transport events already taken".into()))?;
        Ok(Negotiated { inbound, events })
    }

    /// Ждёт медиа, пока вход не отменён. Треки, пришедшие после отмены,
    /// сразу возвращаются источнику.
    async fn acquire_media(&self, epoch: u64) -> Result<MediaTrackSet> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() != epoch {
            return Err(SessionError::Cancelled);
        }

        let media = self.media.clone();
        let constraints = self.config.media.clone();
        let mut acquisition = tokio::spawn(async move { media.acquire(&constraints).await });

        tokio::select! {
            joined = &mut acquisition => match joined {
                Ok(result) => result,
                Err(e) => Err(SessionError::MediaAcquisition(format!(
                    "acquisition task failed: {e}"
                ))),
            },
            _ = cancel.changed() => {
                info!("Media acquisition cancelled");
                let media = self.media.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(tracks)) = acquisition.await {
                        info!("Releasing {} tracks acquired after cancellation", tracks.len());
                        media.release(tracks);
                    }
                });
                Err(SessionError::Cancelled)
            }
        }
    }

    fn ensure_not_cancelled(&self, epoch: u64) -> Result<()> {
        if *self.cancel.borrow() != epoch {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    fn monitor_for(&self, generation: u64, engine: &NegotiationEngine) -> ConnectivityMonitor {
        let mut monitor = ConnectivityMonitor::new(
            self.status.clone(),
            self.keep_awake.clone(),
            self.config.heartbeat_interval(),
        );
        monitor.watch(engine.transport());

        let me = self.me.clone();
        monitor.on_recovery(Arc::new(move |reason: RecoveryReason| {
            let Some(controller) = me.upgrade() else {
                return;
            };
            info!("Session #{generation} needs recovery: {:?}", reason);
            tokio::spawn(async move {
                if let Err(e) = controller.rejoin_generation(Some(generation)).await {
                    warn!("Recovery of session #{generation} failed: {e}");
                }
            });
        }));
        monitor
    }

    fn remote_track_handler_for(&self, role: Role, tracks: &MediaTrackSet) -> RemoteTrackHandler {
        let user = self
            .remote_track_handler
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        let mute_on_remote = role == Role::Join && self.config.mute_local_video_on_remote;
        let local_video: Vec<MediaTrack> = tracks
            .iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .cloned()
            .collect();

        Arc::new(move |track: RemoteTrack| {
            if mute_on_remote && track.kind == TrackKind::Video && !local_video.is_empty() {
                for local in &local_video {
                    local.set_enabled(false);
                }
                info!("Remote video arrived, local video disabled");
            }
            if let Some(handler) = &user {
                handler(track);
            }
        })
    }

    /// Полная остановка сессии: цикл, heartbeat, треки, транспорт, канал
    async fn retire(&self, mut session: ActiveSession) {
        let generation = session.link.generation;
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
        session.link.monitor.lock().await.shutdown();
        if let Some(tracks) = session.tracks.take() {
            self.media.release(tracks);
        }
        if let Err(e) = session.link.engine.lock().await.close().await {
            warn!("Failed to close transport of session #{generation}: {e}");
        }
        session.channel.close();
        info!("Session #{generation} retired");
    }

    /// Запрос восстановления отброшен, а сессия осталась: снимаем защёлку
    /// монитора, чтобы следующий обрыв снова запустил rejoin
    async fn rearm_recovery(&self, generation: u64) {
        let link = self
            .active
            .lock()
            .await
            .as_ref()
            .filter(|s| s.link.generation == generation)
            .map(|s| s.link.clone());
        if let Some(link) = link {
            debug!("Re-arming recovery of session #{generation}");
            link.monitor.lock().await.recovery_finished();
        }
    }

    async fn abandon(&self, mut staged: Staged) {
        if let Some(tracks) = staged.tracks.take() {
            self.media.release(tracks);
        }
        if let Some(mut engine) = staged.engine.take() {
            if let Err(e) = engine.close().await {
                warn!("Failed to close transport: {e}");
            }
        }
        if let Some(mut channel) = staged.channel.take() {
            channel.close();
        }
    }

    fn report_failure(&self, what: &str, e: &SessionError) {
        if matches!(e, SessionError::Cancelled | SessionError::Validation(_)) {
            return;
        }
        warn!("{what}: {e}");
        self.status.notify(&format!("{what}：{e}"), Severity::Error);
    }
}
