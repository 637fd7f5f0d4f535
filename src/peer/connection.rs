use crate::config::DEFAULT_ICE_SERVERS;
use crate::error::{SessionError, SessionResult};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::peer::media::LocalTrack;
use crate::peer::transport::{GatheringComplete, PeerTransport, TransportFactory, TransportState};
use crate::peer::types::{DescriptionKind, IceCandidate, Role, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

/// Фабрика peer connection на базе webrtc-rs
pub struct WebRtcFactory {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcFactory {
    /// Проверяет пользовательские ICE серверы так же, как при их установке из UI
    pub fn new(servers: Vec<ServerConfig>) -> SessionResult<Self> {
        for server in &servers {
            if server.url.is_empty() {
                return Err(SessionError::Transport("ICE server URL cannot be empty".into()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SessionError::Transport(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        info!("Using {} ICE servers", servers.len());
        Ok(Self {
            ice_servers: servers,
        })
    }

    pub fn with_default_servers() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::with_default_servers()
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn open(&self, role: Role, session_id: &str) -> SessionResult<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(role, session_id, rtc_config(&self.ice_servers)).await?;
        Ok(Arc::new(transport))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn map_state(st: RTCPeerConnectionState) -> TransportState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    session_id: String,
    candidates: Arc<Mutex<Vec<IceCandidate>>>,
    state_tx: Arc<watch::Sender<TransportState>>,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcTransport {
    async fn new(role: Role, session_id: &str, config: RTCConfiguration) -> SessionResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(config).await?);
        debug!("Peer connection created for session {session_id} as {role:?}");

        let candidates: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));
        let (state_tx, _) = watch::channel(TransportState::New);
        let state_tx = Arc::new(state_tx);

        // Обработчик для сбора локальных кандидатов
        let sink = Arc::clone(&candidates);
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            if let Some(c) = cand {
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        dump_candidate("LOCAL", &candidate);
                        sink.lock().push(candidate);
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                }
            } else {
                debug!("ICE candidate gathering completed (null candidate received)");
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {state:?}");
            Box::pin(async {})
        }));

        let tx = Arc::clone(&state_tx);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {st:?}");
            tx.send_replace(map_state(st));
            Box::pin(async {})
        }));

        pc.on_track(Box::new(|track, _receiver, _transceiver| {
            info!("Remote {:?} track arrived: {}", track.kind(), track.id());
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            session_id: session_id.to_owned(),
            candidates,
            state_tx,
            rtcp_readers: Mutex::new(Vec::new()),
        })
    }

    /// Ставит локальное описание и возвращает сигнал окончания сбора.
    /// Promise берётся до set_local_description, иначе его можно пропустить.
    async fn start_gathering(&self, desc: RTCSessionDescription) -> SessionResult<GatheringComplete> {
        self.candidates.lock().clear();

        let mut gather_done = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await?;

        let (tx, complete) = GatheringComplete::channel();
        let candidates = Arc::clone(&self.candidates);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let _ = gather_done.recv().await;
            let collected = candidates.lock().clone();
            debug!("Collected {} ICE candidates for {session_id}", collected.len());
            analyze_candidates(&collected);
            let _ = tx.send(collected);
        });
        Ok(complete)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_tracks(&self, tracks: &[Arc<LocalTrack>]) -> SessionResult<()> {
        for track in tracks {
            let rtp = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
            let sender = self.pc.add_track(rtp).await?;

            // RTCP нужно вычитывать, иначе interceptor'ы не работают
            let reader = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            self.rtcp_readers.lock().push(reader);
        }
        Ok(())
    }

    async fn create_offer(&self) -> SessionResult<GatheringComplete> {
        let offer = self.pc.create_offer(None).await?;
        self.start_gathering(offer).await
    }

    async fn create_answer(&self) -> SessionResult<GatheringComplete> {
        let answer = self.pc.create_answer(None).await?;
        self.start_gathering(answer).await
    }

    async fn apply_remote(&self, desc: &SessionDescription) -> SessionResult<()> {
        let sdp = match desc.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
            DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
        };
        self.pc.set_remote_description(sdp).await?;

        // Кандидаты из пакета: часть может уже быть в SDP, ошибки не фатальны
        for candidate in &desc.candidates {
            dump_candidate("REMOTE", candidate);
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            };
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!("Failed to add remote candidate: {e}");
            }
        }
        Ok(())
    }

    async fn local_sdp(&self) -> SessionResult<String> {
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SessionError::Transport("local description is not set".into()))
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) {
        for reader in self.rtcp_readers.lock().drain(..) {
            reader.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection {}: {e}", self.session_id);
        }
    }
}
