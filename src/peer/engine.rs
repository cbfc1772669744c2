use crate::error::{Result, SessionError};
use crate::media::MediaTrackSet;
use crate::peer::ice::{CandidateBuffer, PendingRemoteCandidates};
use crate::peer::state::{ConnectivityState, NegotiationState};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportHandle};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub type RemoteTrackHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;

/// Очередь событий транспорта, которую после финализации offer-а забирает
/// цикл сессии. Сначала отдаются события, отложенные во время сбора кандидатов.
pub struct EventQueue {
    backlog: VecDeque<TransportEvent>,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventQueue {
    pub async fn next(&mut self) -> Option<TransportEvent> {
        if let Some(ev) = self.backlog.pop_front() {
            return Some(ev);
        }
        self.rx.recv().await
    }
}

/// Ведёт peer connection через offer → local description → answer.
/// Недопустимые переходы отклоняются ошибкой, а не игнорируются.
pub struct NegotiationEngine {
    transport: Arc<dyn PeerTransport>,
    events: Option<EventQueue>,
    state: NegotiationState,
    attached: usize,
    offer: Option<SessionDescription>,
    remote_applied: bool,
    transport_connected: bool,
    candidates: CandidateBuffer,
    pending_remote: PendingRemoteCandidates,
    remote_track_handler: Option<RemoteTrackHandler>,
}

impl NegotiationEngine {
    pub fn new(handle: TransportHandle) -> Self {
        Self {
            transport: handle.transport,
            events: Some(EventQueue {
                backlog: VecDeque::new(),
                rx: handle.events,
            }),
            state: NegotiationState::Idle,
            attached: 0,
            offer: None,
            remote_applied: false,
            transport_connected: false,
            candidates: CandidateBuffer::default(),
            pending_remote: PendingRemoteCandidates::default(),
            remote_track_handler: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    pub fn attached_tracks(&self) -> usize {
        self.attached
    }

    /// Привязывает треки к транспорту. Только до создания offer-а.
    pub async fn attach_local_tracks(&mut self, tracks: &MediaTrackSet) -> Result<usize> {
        if self.state != NegotiationState::Idle || self.offer.is_some() {
            return Err(SessionError::InvalidState(format!(
                "tracks must be attached before the offer (state {})",
                self.state
            )));
        }

        let mut added = 0;
        for track in tracks.iter().filter(|t| t.is_live()) {
            self.transport.add_track(track).await?;
            debug!("Attached local {} track {}", track.kind(), track.id());
            added += 1;
        }
        self.attached += added;
        Ok(added)
    }

    /// Повторный вызов в `idle` возвращает тот же offer
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        if self.state != NegotiationState::Idle {
            return Err(SessionError::InvalidState(format!(
                "cannot create offer in state {}",
                self.state
            )));
        }
        if let Some(offer) = &self.offer {
            return Ok(offer.clone());
        }

        info!("Creating offer...");
        let offer = self.transport.create_offer().await?;
        self.offer = Some(offer.clone());
        Ok(offer)
    }

    pub async fn commit_local_description(&mut self, desc: &SessionDescription) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(SessionError::InvalidState(format!(
                "local description already committed (state {})",
                self.state
            )));
        }

        info!("Setting local description ({:?})...", desc.kind);
        self.transport.set_local_description(desc).await?;
        self.state = NegotiationState::GatheringOffer;
        Ok(())
    }

    /// Ждёт окончания сбора кандидатов или таймаута, что наступит раньше,
    /// и возвращает итоговое описание вместе с собранными кандидатами.
    pub async fn await_finalized(&mut self, limit: Duration) -> Result<SessionDescription> {
        if self.state != NegotiationState::GatheringOffer {
            return Err(SessionError::InvalidState(format!(
                "nothing to finalize in state {}",
                self.state
            )));
        }
        let queue = self.events.as_mut().ok_or_else(|| {
            SessionError::InvalidState("transport events already detached".into())
        })?;

        info!("Waiting for ICE candidates...");
        let candidates = &mut self.candidates;
        let gathering = async {
            loop {
                match queue.rx.recv().await {
                    Some(TransportEvent::Candidate(c)) => {
                        candidates.push(c);
                    }
                    Some(TransportEvent::GatheringComplete) => return true,
                    Some(other) => queue.backlog.push_back(other),
                    None => return false,
                }
            }
        };

        let outcome = timeout(limit, gathering).await;
        match outcome {
            Ok(true) => info!("Collected {} ICE candidates", self.candidates.len()),
            Ok(false) => {
                return Err(SessionError::InvalidState(
                    "transport closed while gathering candidates".into(),
                ))
            }
            Err(_) => warn!(
                "Candidate collection timeout after {:?}, sending {} candidates",
                limit,
                self.candidates.len()
            ),
        }

        let local = self.transport.local_description().await.ok_or_else(|| {
            SessionError::InvalidState("transport has no local description".into())
        })?;
        self.state = NegotiationState::OfferSent;
        Ok(local)
    }

    /// Отдаёт очередь событий циклу сессии (один раз)
    pub fn take_event_queue(&mut self) -> Option<EventQueue> {
        self.events.take()
    }

    pub async fn apply_remote_description(&mut self, desc: &SessionDescription) -> Result<()> {
        if self.remote_applied {
            return Err(SessionError::OutOfOrder(
                "duplicate answer: remote description already applied".into(),
            ));
        }
        if !matches!(
            self.state,
            NegotiationState::OfferSent | NegotiationState::AwaitingAnswer
        ) {
            return Err(SessionError::OutOfOrder(format!(
                "answer received in state {}",
                self.state
            )));
        }
        if desc.kind != SdpKind::Answer {
            return Err(SessionError::OutOfOrder(
                "expected an answer, got an offer".into(),
            ));
        }

        info!("Setting remote description...");
        self.transport.set_remote_description(desc).await?;
        self.remote_applied = true;
        self.state = NegotiationState::AwaitingAnswer;
        info!("Remote description set successfully");

        for candidate in self.pending_remote.drain() {
            debug!("Applying pending candidate: {:?}", candidate);
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!("Failed to apply pending candidate: {e}");
            }
        }

        if self.transport_connected {
            self.mark_connected();
        }
        Ok(())
    }

    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.remote_applied {
            self.transport.add_ice_candidate(&candidate).await
        } else {
            self.pending_remote.push(candidate);
            Ok(())
        }
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn on_remote_track(&mut self, handler: RemoteTrackHandler) {
        self.remote_track_handler = Some(handler);
    }

    /// Разбирает событие транспорта; возвращает новое состояние связности,
    /// если событие его несло
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<ConnectivityState> {
        match event {
            TransportEvent::Candidate(c) => {
                if self.state.is_pre_connected() {
                    self.candidates.push(c);
                }
                None
            }
            TransportEvent::GatheringComplete => {
                debug!("Late gathering-complete in state {}", self.state);
                None
            }
            TransportEvent::Connectivity(state) => {
                self.on_connectivity(state);
                Some(state)
            }
            TransportEvent::RemoteTrack(track) => {
                info!("Remote {} track {} arrived", track.kind, track.id);
                if let Some(handler) = &self.remote_track_handler {
                    handler(track);
                }
                None
            }
        }
    }

    pub fn on_connectivity(&mut self, state: ConnectivityState) {
        let before = self.state;
        match state {
            ConnectivityState::Connected => {
                self.transport_connected = true;
                if self.remote_applied
                    && matches!(
                        self.state,
                        NegotiationState::AwaitingAnswer | NegotiationState::Degraded
                    )
                {
                    self.mark_connected();
                }
            }
            ConnectivityState::Disconnected => {
                self.transport_connected = false;
                if self.state == NegotiationState::Connected {
                    self.state = NegotiationState::Degraded;
                }
            }
            ConnectivityState::Failed => {
                self.transport_connected = false;
                if self.state != NegotiationState::Closed {
                    self.state = NegotiationState::Failed;
                }
            }
            ConnectivityState::Closed => {
                self.transport_connected = false;
                self.state = NegotiationState::Closed;
            }
            ConnectivityState::New | ConnectivityState::Checking => {}
        }
        if before != self.state {
            info!("Negotiation state {} -> {}", before, self.state);
        }
    }

    fn mark_connected(&mut self) {
        self.state = NegotiationState::Connected;
        self.candidates.freeze();
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        self.state = NegotiationState::Closed;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
        local: Mutex<Option<SessionDescription>>,
    }

    impl FakeTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn add_track(&self, track: &MediaTrack) -> Result<()> {
            self.record(&format!("add_track:{}", track.kind()));
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record("create_offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
            self.record("set_local");
            *self.local.lock().unwrap() = Some(desc.clone());
            Ok(())
        }
        async fn local_description(&self) -> Option<SessionDescription> {
            self.local
                .lock()
                .unwrap()
                .clone()
                .map(|d| SessionDescription::offer(format!("{}\na=candidates", d.sdp)))
        }
        async fn set_remote_description(&self, _desc: &SessionDescription) -> Result<()> {
            self.record("set_remote");
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            self.record(&format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }
        async fn stats_snapshot(&self) -> Option<String> {
            None
        }
        async fn close(&self) -> Result<()> {
            self.record("close");
            Ok(())
        }
    }

    fn engine() -> (
        NegotiationEngine,
        Arc<FakeTransport>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let transport = Arc::new(FakeTransport::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(TransportHandle {
            transport: transport.clone(),
            events: rx,
        });
        (engine, transport, tx)
    }

    fn cand(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    async fn offer_sent(
        engine: &mut NegotiationEngine,
        tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> SessionDescription {
        let offer = engine.create_offer().await.unwrap();
        engine.commit_local_description(&offer).await.unwrap();
        tx.send(TransportEvent::GatheringComplete).unwrap();
        engine
            .await_finalized(Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn offer_is_idempotent_only_while_idle() {
        let (mut engine, transport, tx) = engine();
        let first = engine.create_offer().await.unwrap();
        let second = engine.create_offer().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            transport.calls().iter().filter(|c| *c == "create_offer").count(),
            1
        );

        engine.commit_local_description(&first).await.unwrap();
        assert_eq!(engine.state(), NegotiationState::GatheringOffer);
        tx.send(TransportEvent::GatheringComplete).unwrap();
        engine.await_finalized(Duration::from_secs(1)).await.unwrap();
        assert_eq!(engine.state(), NegotiationState::OfferSent);

        let err = engine.create_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn tracks_after_offer_are_rejected() {
        let (mut engine, _transport, _tx) = engine();
        let tracks = MediaTrackSet::new(vec![MediaTrack::new(TrackKind::Audio, "a", "s")]);
        assert_eq!(engine.attach_local_tracks(&tracks).await.unwrap(), 1);

        engine.create_offer().await.unwrap();
        let err = engine.attach_local_tracks(&tracks).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(engine.attached_tracks(), 1);
    }

    #[tokio::test]
    async fn finalized_description_waits_for_gathering() {
        let (mut engine, _transport, tx) = engine();
        let offer = engine.create_offer().await.unwrap();
        engine.commit_local_description(&offer).await.unwrap();

        tx.send(TransportEvent::Candidate(cand("c1 typ host"))).unwrap();
        tx.send(TransportEvent::Connectivity(ConnectivityState::Checking))
            .unwrap();
        tx.send(TransportEvent::Candidate(cand("c2 typ srflx"))).unwrap();
        tx.send(TransportEvent::GatheringComplete).unwrap();

        let finalized = engine
            .await_finalized(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(finalized.sdp.contains("a=candidates"));
        assert_eq!(engine.candidates().len(), 2);

        // неразобранное событие не теряется
        let mut queue = engine.take_event_queue().unwrap();
        assert!(matches!(
            queue.next().await,
            Some(TransportEvent::Connectivity(ConnectivityState::Checking))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_timeout_still_finalizes() {
        let (mut engine, _transport, tx) = engine();
        let offer = engine.create_offer().await.unwrap();
        engine.commit_local_description(&offer).await.unwrap();
        tx.send(TransportEvent::Candidate(cand("c1 typ host"))).unwrap();

        let finalized = engine.await_finalized(Duration::from_secs(10)).await;
        assert!(finalized.is_ok());
        assert_eq!(engine.state(), NegotiationState::OfferSent);
        assert_eq!(engine.candidates().len(), 1);
    }

    #[tokio::test]
    async fn answer_before_offer_is_out_of_order() {
        let (mut engine, transport, _tx) = engine();
        let err = engine
            .apply_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OutOfOrder(_)));
        assert!(!transport.calls().contains(&"set_remote".to_string()));
    }

    #[tokio::test]
    async fn duplicate_answer_is_out_of_order() {
        let (mut engine, _transport, tx) = engine();
        offer_sent(&mut engine, &tx).await;

        let answer = SessionDescription::answer("v=0 answer");
        engine.apply_remote_description(&answer).await.unwrap();
        assert_eq!(engine.state(), NegotiationState::AwaitingAnswer);

        let err = engine.apply_remote_description(&answer).await.unwrap_err();
        assert!(matches!(err, SessionError::OutOfOrder(_)));
    }

    #[tokio::test]
    async fn offer_as_remote_description_is_rejected() {
        let (mut engine, _transport, tx) = engine();
        offer_sent(&mut engine, &tx).await;
        let err = engine
            .apply_remote_description(&SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OutOfOrder(_)));
    }

    #[tokio::test]
    async fn remote_candidates_wait_for_remote_description() {
        let (mut engine, transport, tx) = engine();
        offer_sent(&mut engine, &tx).await;

        engine.add_remote_candidate(cand("early")).await.unwrap();
        assert_eq!(engine.pending_remote_candidates(), 1);
        assert!(!transport.calls().iter().any(|c| c.starts_with("add_candidate")));

        engine
            .apply_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        engine.add_remote_candidate(cand("late")).await.unwrap();

        let calls = transport.calls();
        let applied: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("add_candidate"))
            .collect();
        assert_eq!(applied, vec!["add_candidate:early", "add_candidate:late"]);
    }

    #[tokio::test]
    async fn connectivity_drives_connected_degraded_failed() {
        let (mut engine, _transport, tx) = engine();
        offer_sent(&mut engine, &tx).await;

        // до answer соединения быть не может
        engine.on_connectivity(ConnectivityState::Connected);
        assert_eq!(engine.state(), NegotiationState::OfferSent);

        engine
            .apply_remote_description(&SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(engine.state(), NegotiationState::Connected);
        assert!(engine.candidates().is_frozen());

        engine.on_connectivity(ConnectivityState::Disconnected);
        assert_eq!(engine.state(), NegotiationState::Degraded);
        engine.on_connectivity(ConnectivityState::Connected);
        assert_eq!(engine.state(), NegotiationState::Connected);
        engine.on_connectivity(ConnectivityState::Failed);
        assert_eq!(engine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn remote_tracks_reach_the_handler_in_arrival_order() {
        let (mut engine, _transport, _tx) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.on_remote_track(Arc::new(move |t: RemoteTrack| {
            sink.lock().unwrap().push(t.id);
        }));

        for id in ["video-1", "audio-1"] {
            engine.handle_event(TransportEvent::RemoteTrack(RemoteTrack {
                id: id.into(),
                stream_id: "pion".into(),
                kind: TrackKind::Video,
                track: None,
            }));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["video-1", "audio-1"]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut engine, transport, _tx) = engine();
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.state(), NegotiationState::Closed);
        assert_eq!(
            transport.calls().iter().filter(|c| *c == "close").count(),
            1
        );
    }
}
