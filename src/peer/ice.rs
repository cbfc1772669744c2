use crate::peer::types::IceCandidate;
use tracing::{debug, warn};

/// Локальные кандидаты, собранные до установления соединения.
/// Только добавление; после `freeze` новые кандидаты отбрасываются.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    candidates: Vec<IceCandidate>,
    frozen: bool,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.frozen {
            debug!("Candidate buffer frozen, dropping {}", candidate.candidate);
            return false;
        }
        self.candidates.push(candidate);
        debug!("Added ICE candidate, total count: {}", self.candidates.len());
        true
    }

    pub fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            analyze_candidates(&self.candidates);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn as_slice(&self) -> &[IceCandidate] {
        &self.candidates
    }
}

/// Удалённые кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingRemoteCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingRemoteCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!("Remote description not set yet, queuing candidate");
        self.queue.push(candidate);
    }

    /// Забирает все отложенные кандидаты в порядке поступления
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.srflx == 0 && summary.relay == 0 && !candidates.is_empty() {
        warn!("No srflx or relay candidates found! Connection through NAT may fail.");
    }
    summary
}
