use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{MediaTrack, TrackKind};
use crate::peer::state::ConnectivityState;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportFactory, TransportHandle};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Peer connection на webrtc-rs
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    /// Создаём peer и подписываем все обработчики на очередь событий
    pub async fn new(
        ice_servers: &[ServerConfig],
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        // Обработчик для сбора локальных кандидатов
        let cand_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate("LOCAL", &c);
                    if let Ok(init) = c.to_json() {
                        let _ = cand_tx.send(TransportEvent::Candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                }
                None => {
                    // cand == None означает конец сбора
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = cand_tx.send(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let state_tx = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            info!("ICE connection state changed to: {:?}", st);
            if let Some(state) = ConnectivityState::from_ice(st) {
                let _ = state_tx.send(TransportEvent::Connectivity(state));
            }
            Box::pin(async {})
        }));

        let track_tx = tx;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                match TrackKind::from_codec_type(track.kind()) {
                    Some(kind) => {
                        let remote = RemoteTrack {
                            id: track.id(),
                            stream_id: track.stream_id(),
                            kind,
                            track: Some(track),
                        };
                        let _ = track_tx.send(TransportEvent::RemoteTrack(remote));
                    }
                    None => warn!("Remote track {} has unspecified kind", track.id()),
                }
                Box::pin(async {})
            },
        ));

        Ok((Self { pc }, rx))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let sender = self.pc.add_track(track.local()).await?;

        // RTCP надо вычитывать, иначе интерцепторы не работают
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        match desc.sdp_type {
            RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
            RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
            _ => None,
        }
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn stats_snapshot(&self) -> Option<String> {
        dump_selected_pair(&self.pc, "HEARTBEAT").await
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    rtc.map_err(SessionError::from)
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Конфигурация серверов → формат webrtc-rs
pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Фабрика реальных транспортов
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self) -> Result<TransportHandle> {
        let (transport, events) = RtcTransport::new(&self.ice_servers).await?;
        Ok(TransportHandle {
            transport: Arc::new(transport),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "a".into(),
                r#type: "stun".into(),
                url: "stun.example:19302".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "relay.example:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ];
        let rtc = get_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example:19302".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:relay.example:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "pass");
        assert!(rtc[0].username.is_empty());
    }

    #[tokio::test]
    async fn real_transport_produces_an_offer_with_tracks() {
        let (transport, _events) = RtcTransport::new(&[]).await.unwrap();
        let track = MediaTrack::new(TrackKind::Audio, "audio", "stream");
        transport.add_track(&track).await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        transport.close().await.unwrap();
    }
}
