//! Автомат одного звонка.
//!
//! Один tokio-таск разбирает единую очередь входов: команды UI, кадры
//! сигнализации, события медиа-транспорта, таймеры и результаты
//! асинхронных шагов. Каждый вход обрабатывается до конца, прежде чем
//! берётся следующий. Асинхронные шаги (захват устройств, SDP) выполняются
//! в отдельных задачах и возвращаются как `Input::Continuation` с
//! идентификатором сессии; результат для уже ушедшей сессии освобождается
//! и больше ни на что не влияет.

use crate::call::events::CallObserver;
use crate::call::glare::{self, GlareOutcome};
use crate::call::presence::{Availability, PresenceGate};
use crate::call::state::{CallState, CallTrigger, EndReason};
use crate::config::CallConfig;
use crate::error::{CallError, MediaError};
use crate::peer::capture::LocalStream;
use crate::peer::codec::{dec_for_session, enc};
use crate::peer::gateway::{MediaEvent, MediaEventSink, MediaGateway, MediaGatewayFactory};
use crate::peer::ice::{analyze_candidates, CandidateApplier};
use crate::peer::types::{IceCandidate, MediaKind, SdpPayload, SessionDescription, TransportState};
use crate::session::{CallSession, Role, SessionId, UserId};
use crate::signaling::channel::{LinkStatus, SignalingChannel, Subscription};
use crate::signaling::messages::{Envelope, RejectReason, SignalKind, SignalMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Start {
        peer: UserId,
        media_kind: MediaKind,
        reply: Reply<SessionId>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reason: RejectReason,
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Ring,
    Negotiation,
    DisconnectGrace,
}

/// Итог асинхронного шага
pub(crate) enum Continuation {
    /// Устройства захвачены, локальный offer (звонящий) или answer (принимающий) готов
    Prepared {
        gateway: Arc<dyn MediaGateway>,
        stream: LocalStream,
        description: SessionDescription,
    },
    PrepareFailed {
        gateway: Option<Arc<dyn MediaGateway>>,
        error: MediaError,
    },
    RemoteApplied(Result<(), MediaError>),
}

pub(crate) enum Input {
    Command(Command),
    Signal(Envelope),
    Link(LinkStatus),
    Media(SessionId, MediaEvent),
    Presence {
        session_id: SessionId,
        availability: Availability,
    },
    Continuation {
        session_id: SessionId,
        step: Continuation,
    },
    Timer {
        session_id: SessionId,
        timer: TimerKind,
        generation: u64,
    },
    Shutdown,
}

/// Взведённый таймер; `generation` отличает его от прежних взводов того же слота
struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    ring: Option<ArmedTimer>,
    negotiation: Option<ArmedTimer>,
    grace: Option<ArmedTimer>,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::Ring => &mut self.ring,
            TimerKind::Negotiation => &mut self.negotiation,
            TimerKind::DisconnectGrace => &mut self.grace,
        }
    }

    fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slot(kind).take() {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Снимает таймер, если сработал именно он. Срабатывание отменённого
    /// или перевзведённого таймера может уже стоять в очереди.
    fn fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        let slot = self.slot(kind);
        if slot.as_ref().map(|armed| armed.generation) != Some(generation) {
            return false;
        }
        slot.take();
        true
    }

    fn cancel_all(&mut self) {
        self.cancel(TimerKind::Ring);
        self.cancel(TimerKind::Negotiation);
        self.cancel(TimerKind::DisconnectGrace);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Живая (не терминальная) сессия и ресурсы, которыми она владеет
struct LiveCall {
    session: CallSession,
    gateway: Option<Arc<dyn MediaGateway>>,
    local_stream: Option<LocalStream>,
    /// offer звонящего, ждёт accept на стороне принимающего
    remote_offer: Option<SessionDescription>,
    remote_applied: bool,
    applier: Option<CandidateApplier>,
    /// локальные кандидаты, которые ещё рано отправлять
    outbound: Vec<IceCandidate>,
    outbound_open: bool,
    gathered: Vec<IceCandidate>,
    /// собеседник уже знает этот session_id
    peer_knows: bool,
    reject_reason: RejectReason,
    timers: Timers,
}

impl LiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            gateway: None,
            local_stream: None,
            remote_offer: None,
            remote_applied: false,
            applier: None,
            outbound: Vec::new(),
            outbound_open: false,
            gathered: Vec::new(),
            peer_knows: false,
            reject_reason: RejectReason::Declined,
            timers: Timers::default(),
        }
    }

    fn state(&self) -> CallState {
        self.session.state
    }

    fn transition(&mut self, trigger: CallTrigger) -> Result<CallState, CallError> {
        let next = self.session.state.next(trigger)?;
        debug!(
            session = %self.session.session_id,
            from = %self.session.state,
            to = %next,
            ?trigger,
            "transition"
        );
        self.session.state = next;
        Ok(next)
    }

    /// Ждём ли мы сейчас результата подготовки медиа
    fn awaiting_prepare(&self) -> bool {
        self.gateway.is_none()
            && match self.session.role {
                Role::Caller => self.state() == CallState::OutgoingRinging,
                Role::Callee => self.state() == CallState::Negotiating,
            }
    }
}

pub struct CallSessionStateMachine {
    local_user: UserId,
    config: CallConfig,
    signaling: Arc<SignalingChannel>,
    media: Arc<dyn MediaGatewayFactory>,
    presence: Arc<dyn PresenceGate>,
    observer: Arc<dyn CallObserver>,
    inputs: mpsc::UnboundedSender<Input>,
    live: Option<LiveCall>,
    last: Option<CallSession>,
    snapshot: watch::Sender<Option<CallSession>>,
    subscriptions: Vec<Subscription>,
    timer_generation: u64,
}

impl CallSessionStateMachine {
    pub(crate) fn new(
        config: CallConfig,
        signaling: Arc<SignalingChannel>,
        media: Arc<dyn MediaGatewayFactory>,
        presence: Arc<dyn PresenceGate>,
        observer: Arc<dyn CallObserver>,
        inputs: mpsc::UnboundedSender<Input>,
        snapshot: watch::Sender<Option<CallSession>>,
    ) -> Self {
        let mut subscriptions = Vec::with_capacity(SignalKind::ALL.len() + 1);
        for kind in SignalKind::ALL {
            let tx = inputs.clone();
            subscriptions.push(signaling.on(kind, move |envelope| {
                let _ = tx.send(Input::Signal(envelope.clone()));
            }));
        }
        let tx = inputs.clone();
        subscriptions.push(signaling.on_status(move |status| {
            let _ = tx.send(Input::Link(status));
        }));

        Self {
            local_user: signaling.local_user().clone(),
            config,
            signaling,
            media,
            presence,
            observer,
            inputs,
            live: None,
            last: None,
            snapshot,
            subscriptions,
            timer_generation: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        info!(user = %self.local_user, "call endpoint started");
        while let Some(input) = rx.recv().await {
            if matches!(input, Input::Shutdown) {
                if self.live.is_some() {
                    let _ = self.end_call().await;
                    self.publish();
                }
                break;
            }
            self.handle(input).await;
            self.publish();
        }
        // обработчики снимаются вместе с автоматом
        self.subscriptions.clear();
        info!(user = %self.local_user, "call endpoint stopped");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command).await,
            Input::Signal(envelope) => self.handle_signal(envelope).await,
            Input::Link(status) => self.handle_link(status).await,
            Input::Media(session_id, event) => self.handle_media(session_id, event).await,
            Input::Presence {
                session_id,
                availability,
            } => self.on_presence(session_id, availability).await,
            Input::Continuation { session_id, step } => {
                self.on_continuation(session_id, step).await
            }
            Input::Timer {
                session_id,
                timer,
                generation,
            } => self.on_timer(session_id, timer, generation).await,
            Input::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                peer,
                media_kind,
                reply,
            } => {
                let _ = reply.send(self.start_call(peer, media_kind));
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept_call());
            }
            Command::Reject { reason, reply } => {
                let _ = reply.send(self.reject_call(reason).await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.end_call().await);
            }
        }
    }

    fn publish(&self) {
        let current = self
            .live
            .as_ref()
            .map(|live| live.session.clone())
            .or_else(|| self.last.clone());
        self.snapshot.send_replace(current);
    }

    /// Текущая живая сессия с этим id
    fn current_mut(&mut self, session_id: &SessionId) -> Option<&mut LiveCall> {
        self.live
            .as_mut()
            .filter(|live| &live.session.session_id == session_id)
    }

    // ========== UI операции ==========

    fn start_call(&mut self, peer: UserId, media_kind: MediaKind) -> Result<SessionId, CallError> {
        if self.live.is_some() {
            return Err(CallError::AlreadyInCall);
        }
        let session_id = SessionId::generate();
        let session = CallSession::new(session_id.clone(), Role::Caller, peer.clone(), media_kind);
        self.live = Some(LiveCall::new(session));
        info!(session = %session_id, %peer, %media_kind, "starting call");

        // присутствие проверяется до любой сигнализации
        let presence = self.presence.clone();
        let tx = self.inputs.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            let availability = presence.is_available(&peer).await;
            let _ = tx.send(Input::Presence {
                session_id: sid,
                availability,
            });
        });
        Ok(session_id)
    }

    fn accept_call(&mut self) -> Result<(), CallError> {
        let negotiation_timeout = self.config.negotiation_timeout;
        let live = self.live.as_mut().ok_or(CallError::NoSession)?;
        live.transition(CallTrigger::LocalAccept)?;
        live.timers.cancel(TimerKind::Ring);
        let session_id = live.session.session_id.clone();
        let media_kind = live.session.media_kind;
        let offer = live.remote_offer.take();
        info!(session = %session_id, "call accepted locally");

        let timer = self.arm(&session_id, TimerKind::Negotiation, negotiation_timeout);
        if let Some(live) = self.live.as_mut() {
            live.timers.negotiation = Some(timer);
        }
        match offer {
            Some(offer) => self.spawn_prepare(&session_id, media_kind, Some(offer)),
            None => {
                // без offer принимать нечего; такой сессии быть не должно
                warn!(session = %session_id, "accepted call has no remote offer");
                let tx = self.inputs.clone();
                let _ = tx.send(Input::Continuation {
                    session_id,
                    step: Continuation::PrepareFailed {
                        gateway: None,
                        error: MediaError::Negotiation("remote offer missing".into()),
                    },
                });
            }
        }
        Ok(())
    }

    async fn reject_call(&mut self, reason: RejectReason) -> Result<(), CallError> {
        let live = self.live.as_mut().ok_or(CallError::NoSession)?;
        live.reject_reason = reason;
        self.finish(CallTrigger::LocalReject, EndReason::LocalRejected)
            .await
    }

    /// Идемпотентно: без живой сессии ничего не делает
    async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(live) = self.live.as_ref() else {
            debug!("end_call without a live session ignored");
            return Ok(());
        };
        if live.state() == CallState::Active {
            self.finish(CallTrigger::LocalEnd, EndReason::LocalHangup)
                .await
        } else {
            self.finish(CallTrigger::LocalCancel, EndReason::LocalCancelled)
                .await
        }
    }

    // ========== сигнализация ==========

    async fn handle_signal(&mut self, envelope: Envelope) {
        let Envelope {
            session_id,
            from_user_id,
            message,
            ..
        } = envelope;

        if let SignalMessage::CallInvite { media_kind, offer } = message {
            self.handle_incoming(session_id, from_user_id, media_kind, offer)
                .await;
            return;
        }

        let Some(live) = self.current_mut(&session_id) else {
            debug!(session = %session_id, kind = message.kind().as_str(), "stale signal ignored");
            return;
        };
        if live.session.peer != from_user_id {
            warn!(session = %session_id, from = %from_user_id, "signal from unexpected user ignored");
            return;
        }

        let outcome = match message {
            SignalMessage::CallAccept { answer } => self.on_remote_accepted(answer).await,
            SignalMessage::CallReject {
                reason: RejectReason::Declined,
            } => {
                self.finish(CallTrigger::RemoteRejected, EndReason::Declined)
                    .await
            }
            SignalMessage::CallReject {
                reason: RejectReason::Busy,
            } => self.finish(CallTrigger::PeerBusy, EndReason::PeerBusy).await,
            SignalMessage::CallCandidate { candidate } => self.on_remote_candidate(candidate),
            SignalMessage::CallEnd { reason } => {
                info!(session = %session_id, %reason, "peer ended the call");
                self.finish(CallTrigger::RemoteEnd, EndReason::RemoteEnded)
                    .await
            }
            SignalMessage::CallUnavailable => {
                self.finish(CallTrigger::PeerUnavailable, EndReason::PeerUnavailable)
                    .await
            }
            SignalMessage::CallInvite { .. } => Ok(()),
        };
        if let Err(err) = outcome {
            warn!(session = %session_id, "signal rejected: {err}");
        }
    }

    async fn handle_incoming(
        &mut self,
        session_id: SessionId,
        from: UserId,
        media_kind: MediaKind,
        offer: String,
    ) {
        let mut yielded = false;
        if let Some(live) = self.live.as_ref() {
            if live.session.session_id == session_id {
                debug!(session = %session_id, "repeated invite ignored");
                return;
            }
            let calling_same_peer = live.session.peer == from
                && live.session.role == Role::Caller
                && matches!(live.state(), CallState::Idle | CallState::OutgoingRinging);

            if calling_same_peer {
                match glare::resolve(&self.local_user, &from) {
                    GlareOutcome::KeepCaller => {
                        info!(session = %session_id, peer = %from, "glare: keeping caller role");
                        return;
                    }
                    GlareOutcome::YieldToRemote => {
                        info!(session = %session_id, peer = %from, "glare: yielding to remote call");
                        if let Err(err) = self
                            .finish(CallTrigger::LocalCancel, EndReason::Superseded)
                            .await
                        {
                            warn!("cannot cancel own call on glare: {err}");
                            return;
                        }
                        yielded = true;
                    }
                }
            } else {
                info!(session = %session_id, from = %from, "busy, auto-rejecting incoming call");
                if let Err(err) = self
                    .signaling
                    .send(
                        &session_id,
                        SignalMessage::CallReject {
                            reason: RejectReason::Busy,
                        },
                        &from,
                    )
                    .await
                {
                    warn!("cannot send busy reject: {err}");
                }
                return;
            }
        }

        let payload = match dec_for_session(&offer, session_id.as_str()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session = %session_id, "unusable offer in invite: {err}");
                let notice = SignalMessage::CallEnd {
                    reason: EndReason::NegotiationFailed.code().to_string(),
                };
                if let Err(err) = self.signaling.send(&session_id, notice, &from).await {
                    warn!("cannot report unusable offer: {err}");
                }
                return;
            }
        };

        let mut live = LiveCall::new(CallSession::new(
            session_id.clone(),
            Role::Callee,
            from.clone(),
            media_kind,
        ));
        if let Err(err) = live.transition(CallTrigger::IncomingInvite) {
            warn!("cannot open incoming session: {err}");
            return;
        }
        live.remote_offer = Some(payload.sdp);
        live.peer_knows = true;
        let ring_timeout = self.config.ring_timeout;
        live.timers.ring = Some(self.arm(&session_id, TimerKind::Ring, ring_timeout));
        self.live = Some(live);

        info!(session = %session_id, caller = %from, %media_kind, "incoming call");
        self.observer.on_incoming(&from, media_kind);

        if yielded && self.config.auto_accept_on_glare {
            if let Err(err) = self.accept_call() {
                warn!("auto-accept after glare failed: {err}");
            }
        }
    }

    async fn on_remote_accepted(&mut self, answer: String) -> Result<(), CallError> {
        let negotiation_timeout = self.config.negotiation_timeout;
        let live = self.live.as_mut().ok_or(CallError::NoSession)?;
        // проверяем переход до разбора payload
        live.session.state.next(CallTrigger::RemoteAccepted)?;
        let session_id = live.session.session_id.clone();

        let (payload, gateway) = match (dec_for_session(&answer, session_id.as_str()), live.gateway.clone()) {
            (Ok(payload), Some(gateway)) => (payload, gateway),
            (Err(err), _) => {
                warn!(session = %session_id, "unusable answer: {err}");
                return self
                    .finish(CallTrigger::MediaError, EndReason::NegotiationFailed)
                    .await;
            }
            (Ok(_), None) => {
                warn!(session = %session_id, "answer arrived before local media was ready");
                return self
                    .finish(CallTrigger::MediaError, EndReason::NegotiationFailed)
                    .await;
            }
        };

        live.transition(CallTrigger::RemoteAccepted)?;
        live.timers.cancel(TimerKind::Ring);
        info!(session = %session_id, "call accepted by peer");

        // теперь собеседник может сопоставить наши кандидаты
        live.outbound_open = true;
        let held: Vec<IceCandidate> = live.outbound.drain(..).collect();
        let peer = live.session.peer.clone();
        let timer = self.arm(&session_id, TimerKind::Negotiation, negotiation_timeout);
        if let Some(live) = self.live.as_mut() {
            live.timers.negotiation = Some(timer);
        }
        self.send_candidates(&session_id, &peer, held).await;

        let tx = self.inputs.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            let result = gateway.apply_remote_description(payload.sdp).await;
            let _ = tx.send(Input::Continuation {
                session_id: sid,
                step: Continuation::RemoteApplied(result),
            });
        });
        Ok(())
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        let live = self.live.as_mut().ok_or(CallError::NoSession)?;
        // собеседник может отправить кандидат раньше, чем до нас дойдёт его call-accept
        if !matches!(
            live.state(),
            CallState::OutgoingRinging | CallState::Negotiating | CallState::Active
        ) {
            warn!(
                session = %live.session.session_id,
                state = %live.state(),
                "remote candidate rejected in this state"
            );
            return Ok(());
        }
        match (&live.applier, live.remote_applied) {
            (Some(applier), true) => applier.push(candidate),
            _ => {
                debug!(session = %live.session.session_id, "remote description not set yet, queuing candidate");
                live.session.pending_remote_candidates.push(candidate);
            }
        }
        Ok(())
    }

    async fn handle_link(&mut self, status: LinkStatus) {
        match status {
            LinkStatus::Lost => {
                self.observer.on_signaling_lost();
                let Some(state) = self.live.as_ref().map(LiveCall::state) else {
                    return;
                };
                if state == CallState::Active {
                    warn!("signaling lost during active call, media continues");
                } else if let Err(err) = self
                    .finish(CallTrigger::SignalingLost, EndReason::SignalingLost)
                    .await
                {
                    warn!("cannot fail call on signaling loss: {err}");
                }
            }
            LinkStatus::Restored => self.observer.on_signaling_restored(),
        }
    }

    // ========== асинхронные шаги ==========

    async fn on_presence(&mut self, session_id: SessionId, availability: Availability) {
        let ring_timeout = self.config.ring_timeout;
        let Some(live) = self.current_mut(&session_id) else {
            return;
        };
        if live.state() != CallState::Idle {
            return;
        }
        let outcome = match availability {
            Availability::Available => {
                if let Err(err) = live.transition(CallTrigger::PresenceAvailable) {
                    warn!("cannot start ringing: {err}");
                    return;
                }
                let media_kind = live.session.media_kind;
                let snapshot = live.session.clone();
                let timer = self.arm(&session_id, TimerKind::Ring, ring_timeout);
                if let Some(live) = self.live.as_mut() {
                    live.timers.ring = Some(timer);
                }
                self.observer.on_ringing(&snapshot);
                self.spawn_prepare(&session_id, media_kind, None);
                Ok(())
            }
            Availability::Offline => {
                self.finish(CallTrigger::PeerUnavailable, EndReason::PeerUnavailable)
                    .await
            }
            Availability::Busy => self.finish(CallTrigger::PeerBusy, EndReason::PeerBusy).await,
        };
        if let Err(err) = outcome {
            warn!(session = %session_id, "presence result not applied: {err}");
        }
    }

    /// Открывает транспорт, захватывает устройства и готовит offer/answer
    fn spawn_prepare(
        &self,
        session_id: &SessionId,
        media_kind: MediaKind,
        remote_offer: Option<SessionDescription>,
    ) {
        let factory = self.media.clone();
        let sink = self.media_sink(session_id);
        let tx = self.inputs.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            let step = prepare(factory, sink, media_kind, remote_offer).await;
            let _ = tx.send(Input::Continuation {
                session_id: sid,
                step,
            });
        });
    }

    fn media_sink(&self, session_id: &SessionId) -> MediaEventSink {
        let tx = self.inputs.clone();
        MediaEventSink::new(session_id.clone(), move |sid, event| {
            let _ = tx.send(Input::Media(sid, event));
        })
    }

    async fn on_continuation(&mut self, session_id: SessionId, step: Continuation) {
        let expected = self.live.as_ref().is_some_and(|live| {
            live.session.session_id == session_id
                && match &step {
                    Continuation::Prepared { .. } | Continuation::PrepareFailed { .. } => {
                        live.awaiting_prepare()
                    }
                    Continuation::RemoteApplied(_) => {
                        live.state() == CallState::Negotiating && !live.remote_applied
                    }
                }
        });
        if !expected {
            debug!(session = %session_id, "late continuation discarded");
            discard(step).await;
            return;
        }

        let outcome = match step {
            Continuation::Prepared {
                gateway,
                stream,
                description,
            } => self.on_prepared(&session_id, gateway, stream, description).await,
            Continuation::PrepareFailed { gateway, error } => {
                if let Some(gateway) = gateway {
                    gateway.close().await;
                }
                warn!(session = %session_id, "media preparation failed: {error}");
                self.finish(CallTrigger::MediaError, reason_for(&error)).await
            }
            Continuation::RemoteApplied(Ok(())) => {
                if let Some(live) = self.live.as_mut() {
                    live.remote_applied = true;
                    if let Some(gateway) = live.gateway.clone() {
                        let applier = CandidateApplier::start(gateway);
                        applier.flush(&mut live.session.pending_remote_candidates);
                        live.applier = Some(applier);
                    }
                }
                Ok(())
            }
            Continuation::RemoteApplied(Err(error)) => {
                warn!(session = %session_id, "remote description rejected: {error}");
                self.finish(CallTrigger::MediaError, EndReason::NegotiationFailed)
                    .await
            }
        };
        if let Err(err) = outcome {
            warn!(session = %session_id, "continuation not applied: {err}");
        }
    }

    async fn on_prepared(
        &mut self,
        session_id: &SessionId,
        gateway: Arc<dyn MediaGateway>,
        stream: LocalStream,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let encoded = enc(&SdpPayload {
            sdp: description,
            id: session_id.to_string(),
            ts: chrono::Utc::now().timestamp(),
        });

        let Some(live) = self.live.as_mut() else {
            return Err(CallError::NoSession);
        };
        live.session.local_stream = Some(stream.info().clone());
        live.local_stream = Some(stream);
        live.gateway = Some(gateway.clone());
        let peer = live.session.peer.clone();
        let role = live.session.role;

        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(session = %session_id, "cannot encode session description: {err}");
                return self
                    .finish(CallTrigger::MediaError, EndReason::NegotiationFailed)
                    .await;
            }
        };

        let message = match role {
            Role::Caller => SignalMessage::CallInvite {
                media_kind: live.session.media_kind,
                offer: encoded,
            },
            Role::Callee => {
                // offer уже применён внутри create_answer
                live.remote_applied = true;
                let applier = CandidateApplier::start(gateway);
                applier.flush(&mut live.session.pending_remote_candidates);
                live.applier = Some(applier);
                SignalMessage::CallAccept { answer: encoded }
            }
        };

        if let Err(err) = self.signaling.send(session_id, message, &peer).await {
            warn!(session = %session_id, "cannot deliver session description: {err}");
            return self
                .finish(CallTrigger::SignalingLost, EndReason::SignalingLost)
                .await;
        }

        let held = match self.live.as_mut() {
            Some(live) => {
                live.peer_knows = true;
                if role == Role::Callee {
                    live.outbound_open = true;
                    live.outbound.drain(..).collect()
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };
        self.send_candidates(session_id, &peer, held).await;
        Ok(())
    }

    async fn send_candidates(
        &self,
        session_id: &SessionId,
        peer: &UserId,
        candidates: Vec<IceCandidate>,
    ) {
        for candidate in candidates {
            if let Err(err) = self
                .signaling
                .send(session_id, SignalMessage::CallCandidate { candidate }, peer)
                .await
            {
                warn!(session = %session_id, "cannot send local candidate: {err}");
            }
        }
    }

    // ========== медиа-транспорт ==========

    async fn handle_media(&mut self, session_id: SessionId, event: MediaEvent) {
        let grace = self.config.disconnect_grace;
        let Some(live) = self.current_mut(&session_id) else {
            debug!(session = %session_id, "media event for retired session ignored");
            return;
        };

        match event {
            MediaEvent::LocalCandidate(candidate) => {
                live.gathered.push(candidate.clone());
                if live.outbound_open {
                    let peer = live.session.peer.clone();
                    self.send_candidates(&session_id, &peer, vec![candidate])
                        .await;
                } else {
                    live.outbound.push(candidate);
                }
            }
            MediaEvent::GatheringComplete => analyze_candidates(&live.gathered),
            MediaEvent::RemoteStream(info) => {
                debug!(session = %session_id, stream = %info.id, "remote stream attached");
                live.session.remote_stream = Some(info);
            }
            MediaEvent::StateChanged(TransportState::Connected) => match live.state() {
                CallState::Negotiating => {
                    if live.transition(CallTrigger::MediaConnected).is_ok() {
                        live.session.mark_connected();
                        live.timers.cancel(TimerKind::Negotiation);
                        let snapshot = live.session.clone();
                        info!(session = %session_id, "call connected");
                        self.observer.on_connected(&snapshot);
                    }
                }
                CallState::Active => {
                    if live.timers.cancel(TimerKind::DisconnectGrace) {
                        info!(session = %session_id, "connection recovered during grace period");
                        self.observer.on_media_recovered();
                    }
                }
                _ => {}
            },
            MediaEvent::StateChanged(TransportState::Disconnected) => {
                if live.state() == CallState::Active && live.timers.grace.is_none() {
                    info!(session = %session_id, "transport disconnected, starting grace period");
                    let timer = self.arm(&session_id, TimerKind::DisconnectGrace, grace);
                    if let Some(live) = self.live.as_mut() {
                        live.timers.grace = Some(timer);
                    }
                    self.observer.on_media_interrupted();
                }
            }
            MediaEvent::StateChanged(TransportState::Failed) => {
                let outcome = match live.state() {
                    CallState::Active => {
                        self.finish(CallTrigger::TransportLost, EndReason::TransportLost)
                            .await
                    }
                    CallState::Negotiating => {
                        self.finish(CallTrigger::MediaError, EndReason::NegotiationFailed)
                            .await
                    }
                    _ => Ok(()),
                };
                if let Err(err) = outcome {
                    warn!(session = %session_id, "transport failure not applied: {err}");
                }
            }
            MediaEvent::StateChanged(TransportState::Connecting | TransportState::Closed) => {}
        }
    }

    // ========== таймеры ==========

    fn arm(&mut self, session_id: &SessionId, timer: TimerKind, after: Duration) -> ArmedTimer {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let tx = self.inputs.clone();
        let sid = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Input::Timer {
                session_id: sid,
                timer,
                generation,
            });
        });
        ArmedTimer { generation, handle }
    }

    async fn on_timer(&mut self, session_id: SessionId, timer: TimerKind, generation: u64) {
        let Some(live) = self.current_mut(&session_id) else {
            return;
        };
        if !live.timers.fired(timer, generation) {
            debug!(session = %session_id, ?timer, generation, "stale timer fire ignored");
            return;
        }
        info!(session = %session_id, ?timer, "timer fired");
        let outcome = match timer {
            TimerKind::Ring => {
                self.finish(CallTrigger::RingTimeout, EndReason::RingTimeout)
                    .await
            }
            TimerKind::Negotiation => {
                self.finish(CallTrigger::NegotiationTimeout, EndReason::NegotiationTimeout)
                    .await
            }
            TimerKind::DisconnectGrace => {
                self.finish(CallTrigger::TransportLost, EndReason::TransportLost)
                    .await
            }
        };
        if let Err(err) = outcome {
            debug!(session = %session_id, "timer ignored: {err}");
        }
    }

    // ========== завершение ==========

    /// Единственный путь в терминальное состояние: освобождает ресурсы,
    /// best-effort уведомляет собеседника и отдаёт причину в UI.
    async fn finish(&mut self, trigger: CallTrigger, reason: EndReason) -> Result<(), CallError> {
        let live = self.live.as_ref().ok_or(CallError::NoSession)?;
        let next = live.session.state.next(trigger)?;
        debug_assert_eq!(next, reason.terminal_state());
        let Some(mut live) = self.live.take() else {
            return Err(CallError::NoSession);
        };

        live.timers.cancel_all();
        live.applier = None;
        if let Some(mut stream) = live.local_stream.take() {
            stream.release();
        }
        if let Some(gateway) = live.gateway.take() {
            gateway.close().await;
        }
        live.session.pending_remote_candidates.clear();
        live.session.mark_ended(next, reason);

        let session = live.session.clone();
        if live.peer_knows {
            if let Some(notice) = peer_notice(reason, live.reject_reason) {
                if let Err(err) = self
                    .signaling
                    .send(&session.session_id, notice, &session.peer)
                    .await
                {
                    warn!(session = %session.session_id, "peer not notified of teardown: {err}");
                }
            }
        }

        info!(
            session = %session.session_id,
            state = %session.state,
            reason = reason.code(),
            "call finished"
        );
        self.observer.on_ended(&session, reason);
        self.last = Some(session);
        Ok(())
    }
}

async fn prepare(
    factory: Arc<dyn MediaGatewayFactory>,
    sink: MediaEventSink,
    media_kind: MediaKind,
    remote_offer: Option<SessionDescription>,
) -> Continuation {
    let gateway = match factory.open(sink).await {
        Ok(gateway) => gateway,
        Err(error) => {
            return Continuation::PrepareFailed {
                gateway: None,
                error,
            }
        }
    };
    let stream = match gateway.acquire_local_media(media_kind).await {
        Ok(stream) => stream,
        Err(error) => {
            return Continuation::PrepareFailed {
                gateway: Some(gateway),
                error,
            }
        }
    };
    let description = match remote_offer {
        Some(offer) => gateway.create_answer(offer).await,
        None => gateway.create_offer().await,
    };
    match description {
        Ok(description) => Continuation::Prepared {
            gateway,
            stream,
            description,
        },
        Err(error) => {
            drop(stream);
            Continuation::PrepareFailed {
                gateway: Some(gateway),
                error,
            }
        }
    }
}

/// Освобождает то, что принёс запоздавший шаг
async fn discard(step: Continuation) {
    match step {
        Continuation::Prepared {
            gateway,
            mut stream,
            ..
        } => {
            stream.release();
            gateway.close().await;
        }
        Continuation::PrepareFailed {
            gateway: Some(gateway),
            ..
        } => gateway.close().await,
        Continuation::PrepareFailed { gateway: None, .. } | Continuation::RemoteApplied(_) => {}
    }
}

fn reason_for(error: &MediaError) -> EndReason {
    match error {
        MediaError::PermissionDenied => EndReason::PermissionDenied,
        MediaError::DeviceUnavailable(_) => EndReason::DeviceUnavailable,
        MediaError::Negotiation(_) | MediaError::Closed => EndReason::NegotiationFailed,
    }
}

/// Что сказать собеседнику при завершении
fn peer_notice(reason: EndReason, reject: RejectReason) -> Option<SignalMessage> {
    match reason {
        EndReason::LocalRejected => Some(SignalMessage::CallReject { reason: reject }),
        // инициатива была у собеседника или relay недоступен
        EndReason::RemoteEnded
        | EndReason::Declined
        | EndReason::PeerBusy
        | EndReason::PeerUnavailable
        | EndReason::SignalingLost => None,
        other => Some(SignalMessage::CallEnd {
            reason: other.code().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_initiated_endings_are_not_echoed() {
        let declined = RejectReason::Declined;
        assert!(peer_notice(EndReason::RemoteEnded, declined).is_none());
        assert!(peer_notice(EndReason::PeerBusy, declined).is_none());
        assert_eq!(
            peer_notice(EndReason::LocalRejected, declined),
            Some(SignalMessage::CallReject {
                reason: RejectReason::Declined
            })
        );
        assert_eq!(
            peer_notice(EndReason::RingTimeout, declined),
            Some(SignalMessage::CallEnd {
                reason: "timeout".into()
            })
        );
    }

    #[tokio::test]
    async fn rearmed_slot_ignores_the_previous_fire() {
        let idle = || tokio::spawn(async {});
        let mut timers = Timers::default();
        timers.grace = Some(ArmedTimer {
            generation: 1,
            handle: idle(),
        });
        assert!(timers.cancel(TimerKind::DisconnectGrace));
        timers.grace = Some(ArmedTimer {
            generation: 2,
            handle: idle(),
        });

        assert!(!timers.fired(TimerKind::DisconnectGrace, 1));
        assert!(timers.grace.is_some());
        assert!(timers.fired(TimerKind::DisconnectGrace, 2));
        assert!(timers.grace.is_none());
        assert!(!timers.fired(TimerKind::DisconnectGrace, 2));
        assert!(!timers.fired(TimerKind::Ring, 2));
    }

    #[test]
    fn capture_errors_keep_their_reason() {
        assert_eq!(
            reason_for(&MediaError::PermissionDenied),
            EndReason::PermissionDenied
        );
        assert_eq!(
            reason_for(&MediaError::DeviceUnavailable("no camera".into())),
            EndReason::DeviceUnavailable
        );
        assert_eq!(
            reason_for(&MediaError::Negotiation("bad sdp".into())),
            EndReason::NegotiationFailed
        );
    }
}
