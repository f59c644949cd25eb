use crate::config::DEFAULT_ICE_SERVERS;
use crate::error::MediaError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::capture::{CaptureBackend, LocalStream, SampleSource};
use crate::peer::gateway::{MediaEvent, MediaEventSink, MediaGateway, MediaGatewayFactory};
use crate::peer::ice::{from_rtc_init, looks_valid, to_rtc_init};
use crate::peer::types::{
    IceCandidate, MediaKind, SdpKind, ServerConfig, SessionDescription, StreamInfo, TrackKind,
    TransportState,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Фабрика WebRTC транспортов: один RTCPeerConnection на звонок
pub struct WebRtcGatewayFactory {
    ice_servers: Vec<ServerConfig>,
    capture: Arc<dyn CaptureBackend>,
}

impl WebRtcGatewayFactory {
    pub fn new(ice_servers: Vec<ServerConfig>, capture: Arc<dyn CaptureBackend>) -> Self {
        Self {
            ice_servers,
            capture,
        }
    }
}

#[async_trait]
impl MediaGatewayFactory for WebRtcGatewayFactory {
    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaGateway>, MediaError> {
        let gateway = WebRtcGateway::connect(&self.ice_servers, self.capture.clone(), sink).await?;
        Ok(Arc::new(gateway))
    }
}

pub struct WebRtcGateway {
    pc: Arc<RTCPeerConnection>,
    capture: Arc<dyn CaptureBackend>,
    remote: Arc<Mutex<Option<StreamInfo>>>,
    closed: AtomicBool,
}

impl WebRtcGateway {
    /// создаём Peer и вешаем обработчики кандидатов, состояния и треков
    pub async fn connect(
        ice_servers: &[ServerConfig],
        capture: Arc<dyn CaptureBackend>,
        sink: MediaEventSink,
    ) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Negotiation(format!("codec registration: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| MediaError::Negotiation(format!("interceptor registration: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(ice_servers))
                .await
                .map_err(|e| MediaError::Negotiation(format!("peer connection: {e}")))?,
        );

        // Trickle ICE: каждый кандидат сразу уходит в автомат
        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => sink.emit(MediaEvent::LocalCandidate(from_rtc_init(init))),
                            Err(e) => warn!("cannot serialize local candidate: {e}"),
                        }
                    }
                    // cand == None означает конец сбора
                    None => {
                        debug!("ICE candidate gathering completed");
                        sink.emit(MediaEvent::GatheringComplete);
                    }
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {state:?}");
            Box::pin(async {})
        }));

        // делаем копию для обработчика состояний
        let pc_state = Arc::downgrade(&pc);
        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(session = %state_sink.session_id(), "peer connection state changed to: {st:?}");
            let mapped = match st {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                    Some(TransportState::Connecting)
                }
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };

            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_state.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }

            if let Some(state) = mapped {
                state_sink.emit(MediaEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let remote = Arc::new(Mutex::new(None::<StreamInfo>));
        let track_remote = remote.clone();
        let track_sink = sink;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let info = {
                let mut guard = match track_remote.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let info = guard.get_or_insert_with(|| StreamInfo {
                    id: track.stream_id().to_string(),
                    tracks: Vec::new(),
                });
                if !info.tracks.contains(&kind) {
                    info.tracks.push(kind);
                }
                info.clone()
            };
            debug!(stream = %info.id, ?kind, "remote track arrived");
            track_sink.emit(MediaEvent::RemoteStream(info));
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            capture,
            remote,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    async fn local_description(&self) -> Result<SessionDescription, MediaError> {
        self.pc
            .local_description()
            .await
            .map(from_rtc_description)
            .ok_or_else(|| MediaError::Negotiation("local description missing".into()))
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaGateway for WebRtcGateway {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        self.ensure_open()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        for &track_kind in kind.tracks() {
            // при ошибке открытые ранее источники останавливаются через stop_tx
            let source = match self.capture.open(track_kind).await {
                Ok(source) => source,
                Err(e) => {
                    let _ = stop_tx.send(true);
                    return Err(e);
                }
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(track_kind),
                format!("{track_kind:?}").to_lowercase(),
                "ssc-call".to_owned(),
            ));
            let sender = match self
                .pc
                .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = stop_tx.send(true);
                    return Err(MediaError::DeviceUnavailable(format!("add track: {e}")));
                }
            };

            // RTCP нужно вычитывать, иначе интерсепторы не работают
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });

            tokio::spawn(pump_samples(source, track, stop_rx.clone()));
        }

        info!(%kind, "local media acquired");
        Ok(LocalStream::new(kind, move || {
            let _ = stop_tx.send(true);
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        debug!("Creating offer...");
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set local offer: {e}")))?;
        // НЕ ждем gathering complete - кандидаты идут через trickle
        self.local_description().await
    }

    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.apply_remote_description(remote_offer).await?;
        debug!("Creating answer...");
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set local answer: {e}")))?;
        self.local_description().await
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| MediaError::Negotiation(format!("set remote description: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("transport closed, ignoring remote candidate");
            return;
        }
        if !looks_valid(&candidate) {
            warn!(candidate = %candidate.candidate, "malformed remote candidate ignored");
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(to_rtc_init(candidate)).await {
            warn!("Failed to add ICE candidate: {e}");
        }
    }

    fn remote_stream(&self) -> Option<StreamInfo> {
        match self.remote.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // отключаем обработчики, чтобы закрытие не порождало событий
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close failed: {e}");
        }
        info!("peer connection closed");
    }
}

async fn pump_samples(
    mut source: Box<dyn SampleSource>,
    track: Arc<TrackLocalStaticSample>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            sample = source.next_sample() => {
                let Some(sample) = sample else { break };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("write sample failed: {e}");
                    break;
                }
            }
        }
    }
    debug!(track = track.id(), "capture stopped");
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
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
    }
}

pub fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, MediaError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| MediaError::Negotiation(format!("invalid session description: {e}")))
}

pub fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer | RTCSdpType::Pranswer => SdpKind::Answer,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp,
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        get_user_ice_servers(&DEFAULT_ICE_SERVERS)
    } else {
        get_user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод конфигурации серверов в RTCIceServer
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
