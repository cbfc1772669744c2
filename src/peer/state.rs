use std::fmt;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// ========== NEGOTIATION ==========

/// Состояние согласования offer/answer. Ровно одно на сессию.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    GatheringOffer,
    OfferSent,
    AwaitingAnswer,
    Connected,
    Degraded,
    Failed,
    Closed,
}

impl NegotiationState {
    /// До первого `Connected` кандидаты ещё копятся в буфере
    pub fn is_pre_connected(self) -> bool {
        matches!(
            self,
            NegotiationState::Idle
                | NegotiationState::GatheringOffer
                | NegotiationState::OfferSent
                | NegotiationState::AwaitingAnswer
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::GatheringOffer => "gathering-offer",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Degraded => "degraded",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ========== CONNECTIVITY ==========

/// Зеркало ICE connection state транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// Переходы, после которых нужно восстанавливать сессию
    pub fn needs_recovery(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed
        )
    }

    /// `Unspecified` не несёт информации и пропускается
    pub fn from_ice(state: RTCIceConnectionState) -> Option<Self> {
        match state {
            RTCIceConnectionState::New => Some(ConnectivityState::New),
            RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(ConnectivityState::Connected)
            }
            RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
            RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
            RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
            RTCIceConnectionState::Unspecified => None,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(name)
    }
}
