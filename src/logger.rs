use std::fmt;
use std::sync::Mutex;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Логирование с временными метками. Повторный вызов ничего не делает.
pub fn init_logging() {
    if !crate::config::logging_enabled() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomlink=debug,roomlink_lib=debug".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".into()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
            init.candidate, init.sdp_mid, init.sdp_mline_index, init.username_fragment
        );
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) -> Option<String> {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                let line = format!(
                    "{}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
                debug!("STATS {moment}: {line}");
                return Some(line);
            }
        }
    }
    None
}

/// ========== STATUS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// Канал статуса к UI: вызывается на каждом переходе связности
/// и на каждой восстановимой ошибке
pub trait StatusSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Статус только в лог (консольный клиент)
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!("STATUS: {message}"),
            Severity::Error => error!("STATUS: {message}"),
        }
    }
}

/// Запоминает все уведомления; нужен UI-слоям, которые опрашивают статус
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    entries: Mutex<Vec<(String, Severity)>>,
}

impl RecordingStatusSink {
    pub fn entries(&self) -> Vec<(String, Severity)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, message: &str) -> usize {
        self.entries().iter().filter(|(m, _)| m == message).count()
    }

    pub fn last(&self) -> Option<(String, Severity)> {
        self.entries().last().cloned()
    }
}

impl StatusSink for RecordingStatusSink {
    fn notify(&self, message: &str, severity: Severity) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((message.to_owned(), severity));
        }
    }
}
