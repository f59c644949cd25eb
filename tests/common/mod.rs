#![allow(dead_code)]

use async_trait::async_trait;
use ssc_call::call::{CallObserver, CallState, EndReason};
use ssc_call::error::MediaError;
use ssc_call::peer::codec::enc;
use ssc_call::peer::{
    IceCandidate, LocalStream, MediaEvent, MediaEventSink, MediaGateway, MediaGatewayFactory,
    MediaKind, SdpKind, SdpPayload, SessionDescription, StreamInfo, TransportState,
};
use ssc_call::session::{CallSession, SessionId, UserId};
use ssc_call::signaling::{LoopbackRelay, SignalingChannel};
use ssc_call::{CallConfig, CallEndpoint};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Счётчики побочных эффектов всех транспортов одной стороны
#[derive(Default)]
pub struct MediaLedger {
    pub opens: AtomicUsize,
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub closes: AtomicUsize,
    pub applied: Mutex<Vec<String>>,
    pub remote_descriptions: AtomicUsize,
    pub sinks: Mutex<Vec<MediaEventSink>>,
    /// захват устройств завершается отказом
    pub deny_capture: AtomicBool,
    /// первый применённый удалённый кандидат переводит транспорт в Connected
    pub auto_connect: AtomicBool,
    /// если задан, apply_remote_description ждёт разрешения
    pub remote_gate: Mutex<Option<Arc<Semaphore>>>,
    /// если задан, create_offer ждёт разрешения
    pub offer_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MediaLedger {
    pub fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    /// Событие транспорта в последний открытый шлюз
    pub fn emit(&self, event: MediaEvent) {
        let sink = self.sinks.lock().unwrap().last().cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    pub fn hold_remote_description(&self) -> Arc<Semaphore> {
        hold(&self.remote_gate)
    }

    pub fn hold_offer(&self) -> Arc<Semaphore> {
        hold(&self.offer_gate)
    }
}

fn hold(slot: &Mutex<Option<Arc<Semaphore>>>) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *slot.lock().unwrap() = Some(gate.clone());
    gate
}

async fn pass(slot: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = slot.lock().unwrap().clone();
    if let Some(gate) = gate {
        let _ = gate.acquire().await.map(|permit| permit.forget());
    }
}

pub struct FakeFactory {
    pub ledger: Arc<MediaLedger>,
}

impl FakeFactory {
    pub fn new() -> (Arc<Self>, Arc<MediaLedger>) {
        let ledger = Arc::new(MediaLedger::default());
        (
            Arc::new(Self {
                ledger: ledger.clone(),
            }),
            ledger,
        )
    }
}

#[async_trait]
impl MediaGatewayFactory for FakeFactory {
    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaGateway>, MediaError> {
        self.ledger.opens.fetch_add(1, Ordering::SeqCst);
        self.ledger.sinks.lock().unwrap().push(sink.clone());
        Ok(Arc::new(FakeGateway {
            ledger: self.ledger.clone(),
            sink,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeGateway {
    ledger: Arc<MediaLedger>,
    sink: MediaEventSink,
    closed: AtomicBool,
}

impl FakeGateway {
    fn connect_if_scripted(&self) {
        if self.ledger.auto_connect.load(Ordering::SeqCst) {
            self.sink
                .emit(MediaEvent::StateChanged(TransportState::Connected));
        }
    }
}

#[async_trait]
impl MediaGateway for FakeGateway {
    async fn acquire_local_media(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        if self.ledger.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        self.ledger.acquires.fetch_add(1, Ordering::SeqCst);
        let ledger = self.ledger.clone();
        Ok(LocalStream::new(kind, move || {
            ledger.releases.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        pass(&self.ledger.offer_gate).await;
        self.sink
            .emit(MediaEvent::LocalCandidate(candidate("offerer-host")));
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".into(),
        })
    }

    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.apply_remote_description(remote_offer).await?;
        self.sink
            .emit(MediaEvent::LocalCandidate(candidate("answerer-host")));
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".into(),
        })
    }

    async fn apply_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), MediaError> {
        pass(&self.ledger.remote_gate).await;
        self.ledger.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        self.ledger.applied.lock().unwrap().push(candidate.candidate);
        if self.ledger.applied.lock().unwrap().len() == 1 {
            self.connect_if_scripted();
        }
    }

    fn remote_stream(&self) -> Option<StreamInfo> {
        None
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ledger.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn candidate(foundation: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{foundation} 1 udp 2122260223 192.168.1.10 54321 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn encoded(kind: SdpKind, session_id: &SessionId) -> String {
    enc(&SdpPayload {
        sdp: SessionDescription {
            kind,
            sdp: "v=0\r\n".into(),
        },
        id: session_id.to_string(),
        ts: 0,
    })
    .unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Ringing,
    Incoming(UserId, MediaKind),
    Connected,
    Ended(CallState, EndReason),
    SignalingLost,
    SignalingRestored,
    MediaInterrupted,
    MediaRecovered,
}

#[derive(Default)]
pub struct RecordingObserver {
    pub seen: Mutex<Vec<Seen>>,
}

impl RecordingObserver {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn endings(&self) -> Vec<(CallState, EndReason)> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Ended(state, reason) => Some((state, reason)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}

impl CallObserver for RecordingObserver {
    fn on_ringing(&self, _session: &CallSession) {
        self.record(Seen::Ringing);
    }

    fn on_incoming(&self, caller: &UserId, media_kind: MediaKind) {
        self.record(Seen::Incoming(caller.clone(), media_kind));
    }

    fn on_connected(&self, _session: &CallSession) {
        self.record(Seen::Connected);
    }

    fn on_ended(&self, session: &CallSession, reason: EndReason) {
        self.record(Seen::Ended(session.state, reason));
    }

    fn on_signaling_lost(&self) {
        self.record(Seen::SignalingLost);
    }

    fn on_signaling_restored(&self) {
        self.record(Seen::SignalingRestored);
    }

    fn on_media_interrupted(&self) {
        self.record(Seen::MediaInterrupted);
    }

    fn on_media_recovered(&self) {
        self.record(Seen::MediaRecovered);
    }
}

/// Одна сторона звонка на loopback relay
pub struct Side {
    pub user: UserId,
    pub endpoint: CallEndpoint,
    pub media: Arc<MediaLedger>,
    pub observer: Arc<RecordingObserver>,
    pub channel: Arc<SignalingChannel>,
}

pub fn side(relay: &LoopbackRelay, name: &str) -> Side {
    side_with(relay, name, CallConfig::default())
}

pub fn side_with(relay: &LoopbackRelay, name: &str, config: CallConfig) -> Side {
    let user = UserId::new(name);
    let (link, rx) = relay.connect(&user);
    let channel = SignalingChannel::start(user.clone(), link, rx);
    let (factory, media) = FakeFactory::new();
    let observer = Arc::new(RecordingObserver::default());
    let endpoint = CallEndpoint::builder(channel.clone(), factory)
        .config(config)
        .observer(observer.clone())
        .spawn();
    Side {
        user,
        endpoint,
        media,
        observer,
        channel,
    }
}

/// Сторона без автомата: тест сам пишет кадры от её имени
pub struct ScriptedPeer {
    pub user: UserId,
    pub channel: Arc<SignalingChannel>,
    pub inbox: mpsc::UnboundedReceiver<ssc_call::signaling::Envelope>,
    _subs: Vec<ssc_call::signaling::Subscription>,
}

pub fn scripted_peer(relay: &LoopbackRelay, name: &str) -> ScriptedPeer {
    let user = UserId::new(name);
    let (link, rx) = relay.connect(&user);
    let channel = SignalingChannel::start(user.clone(), link, rx);
    let (tx, inbox) = mpsc::unbounded_channel();
    let subs = ssc_call::signaling::SignalKind::ALL
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            channel.on(kind, move |envelope| {
                let _ = tx.send(envelope.clone());
            })
        })
        .collect();
    ScriptedPeer {
        user,
        channel,
        inbox,
        _subs: subs,
    }
}

/// Автомату нужно несколько оборотов, чтобы разобрать очередь
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub async fn wait_for_state(endpoint: &CallEndpoint, state: CallState) -> CallSession {
    let mut rx = endpoint.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = rx.borrow_and_update().clone() {
                if session.state == state {
                    return session;
                }
            }
            if rx.changed().await.is_err() {
                panic!("endpoint stopped while waiting for {state}");
            }
        }
    })
    .await;
    match waited {
        Ok(session) => session,
        Err(_) => panic!(
            "state {state} not reached, last: {:?}",
            endpoint.session().map(|s| s.state)
        ),
    }
}
