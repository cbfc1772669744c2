use crate::error::Result;
use crate::logger::{Severity, StatusSink};
use crate::peer::state::ConnectivityState;
use crate::peer::transport::PeerTransport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const STATUS_NEW: &str = "等待连接…";
pub const STATUS_CHECKING: &str = "正在连接…";
pub const STATUS_CONNECTED: &str = "已连接！";
pub const STATUS_DISCONNECTED: &str = "连接中断，正在重新连接…";
pub const STATUS_FAILED: &str = "连接失败，正在重新连接…";
pub const STATUS_CLOSED: &str = "连接已关闭";
pub const STATUS_RELAY_CLOSED: &str = "信令连接已断开";

pub fn status_message(state: ConnectivityState) -> (&'static str, Severity) {
    match state {
        ConnectivityState::New => (STATUS_NEW, Severity::Info),
        ConnectivityState::Checking => (STATUS_CHECKING, Severity::Info),
        ConnectivityState::Connected => (STATUS_CONNECTED, Severity::Info),
        ConnectivityState::Disconnected => (STATUS_DISCONNECTED, Severity::Error),
        ConnectivityState::Failed => (STATUS_FAILED, Severity::Error),
        ConnectivityState::Closed => (STATUS_CLOSED, Severity::Info),
    }
}

/// Ресурс "не засыпать" на время соединения. Best-effort.
#[async_trait]
pub trait KeepAwake: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    fn release(&self);
}

/// Консольному клиенту держать нечего
#[derive(Debug, Default)]
pub struct NoKeepAwake;

#[async_trait]
impl KeepAwake for NoKeepAwake {
    async fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryReason {
    Connectivity(ConnectivityState),
    Protocol(String),
}

pub type RecoveryCallback = Arc<dyn Fn(RecoveryReason) + Send + Sync>;

/// Следит за связностью транспорта, сообщает статус и запускает восстановление.
/// Пока восстановление идёт, новые триггеры подавляются.
pub struct ConnectivityMonitor {
    state: ConnectivityState,
    status: Arc<dyn StatusSink>,
    keep_awake: Arc<dyn KeepAwake>,
    awake_held: bool,
    heartbeat_interval: Duration,
    heartbeat: Option<JoinHandle<()>>,
    heartbeats: Arc<AtomicU64>,
    transport: Option<Arc<dyn PeerTransport>>,
    recovery: Option<RecoveryCallback>,
    recovering: bool,
}

impl ConnectivityMonitor {
    pub fn new(
        status: Arc<dyn StatusSink>,
        keep_awake: Arc<dyn KeepAwake>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            state: ConnectivityState::New,
            status,
            keep_awake,
            awake_held: false,
            heartbeat_interval,
            heartbeat: None,
            heartbeats: Arc::new(AtomicU64::new(0)),
            transport: None,
            recovery: None,
            recovering: false,
        }
    }

    /// Транспорт, статистику которого снимает heartbeat
    pub fn watch(&mut self, transport: Arc<dyn PeerTransport>) {
        self.transport = Some(transport);
    }

    pub fn on_recovery(&mut self, callback: RecoveryCallback) {
        self.recovery = Some(callback);
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Возвращает true, если состояние действительно изменилось
    pub async fn observe(&mut self, next: ConnectivityState) -> bool {
        if next == self.state {
            return false;
        }
        let prev = self.state;
        self.state = next;
        info!("Connectivity {} -> {}", prev, next);

        let (message, severity) = status_message(next);
        self.status.notify(message, severity);

        if prev == ConnectivityState::Connected {
            self.stop_heartbeat();
            self.release_awake();
        }

        match next {
            ConnectivityState::Connected => {
                self.acquire_awake().await;
                self.start_heartbeat();
            }
            s if s.needs_recovery() => {
                self.trigger(RecoveryReason::Connectivity(s));
            }
            _ => {}
        }
        true
    }

    /// Фатальная для сессии ошибка идёт тем же путём, что и обрыв связи
    pub fn escalate(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.status
            .notify(&format!("协商错误：{reason}"), Severity::Error);
        self.trigger(RecoveryReason::Protocol(reason))
    }

    pub fn recovery_finished(&mut self) {
        self.recovering = false;
    }

    fn trigger(&mut self, reason: RecoveryReason) -> bool {
        if self.recovering {
            debug!("Recovery already in progress, ignoring {:?}", reason);
            return false;
        }
        self.recovering = true;
        match &self.recovery {
            Some(callback) => {
                info!("Triggering recovery: {:?}", reason);
                callback(reason);
            }
            None => warn!("No recovery handler registered for {:?}", reason),
        }
        true
    }

    async fn acquire_awake(&mut self) {
        if self.awake_held {
            return;
        }
        match self.keep_awake.acquire().await {
            Ok(()) => {
                debug!("Stay-awake resource acquired");
                self.awake_held = true;
            }
            Err(e) => warn!("Failed to acquire stay-awake resource: {e}"),
        }
    }

    fn release_awake(&mut self) {
        if self.awake_held {
            self.keep_awake.release();
            self.awake_held = false;
        }
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let interval = self.heartbeat_interval;
        let counter = self.heartbeats.clone();
        let transport = self.transport.clone();

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // первый тик срабатывает сразу
            loop {
                ticker.tick().await;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let pair = match &transport {
                    Some(t) => t.stats_snapshot().await,
                    None => None,
                };
                debug!("Heartbeat #{n}: selected pair {:?}", pair);
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    /// Останавливает heartbeat и отпускает ресурсы
    pub fn shutdown(&mut self) {
        self.stop_heartbeat();
        self.release_awake();
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
