//! Консольный клиент: звонок через WebSocket relay или две стороны в одном процессе.
//!
//! ```text
//! ssc-call [--video] [--hold SECS] [--config call.json]
//! ssc-call --relay wss://relay.example.org --user alice [--call bob]
//! ```

use clap::Parser;
use ssc_call::call::{CallObserver, CallState, EndReason};
use ssc_call::session::{CallSession, SessionId, UserId};
use ssc_call::signaling::{LoopbackRelay, SignalingChannel, WsRelay};
use ssc_call::{
    logger, CallConfig, CallEndpoint, MediaKind, SilentCapture, WebRtcGatewayFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct LogObserver {
    user: UserId,
}

impl CallObserver for LogObserver {
    fn on_ringing(&self, session: &CallSession) {
        info!(user = %self.user, peer = %session.peer, "ringing");
    }

    fn on_incoming(&self, caller: &UserId, media_kind: MediaKind) {
        info!(user = %self.user, "incoming {media_kind} call from {caller}");
    }

    fn on_connected(&self, session: &CallSession) {
        info!(user = %self.user, session = %session.session_id, "connected");
    }

    fn on_ended(&self, session: &CallSession, reason: EndReason) {
        info!(user = %self.user, state = %session.state, "call ended: {reason}");
    }

    fn on_signaling_lost(&self) {
        warn!(user = %self.user, "relay connection lost");
    }

    fn on_media_interrupted(&self) {
        warn!(user = %self.user, "media interrupted, waiting for recovery");
    }
}

#[derive(Parser, Debug)]
#[command(name = "ssc-call")]
#[command(about = "Audio/video call over a WebSocket relay or in-process loopback")]
struct Args {
    /// Адрес relay; без него обе стороны звонка живут в этом процессе
    #[arg(long, requires = "user")]
    relay: Option<String>,

    /// Свой идентификатор на relay
    #[arg(short, long)]
    user: Option<String>,

    /// Кому звонить; без флага клиент только принимает звонки
    #[arg(short, long, requires = "relay")]
    call: Option<String>,

    #[arg(long)]
    video: bool,

    /// JSON с настройками звонка
    #[arg(long)]
    config: Option<PathBuf>,

    /// Сколько секунд держать соединение перед отбоем
    #[arg(long, default_value = "10")]
    hold: u64,
}

fn endpoint(channel: Arc<SignalingChannel>, config: &CallConfig) -> CallEndpoint {
    let media = Arc::new(WebRtcGatewayFactory::new(
        config.ice_servers.clone(),
        Arc::new(SilentCapture),
    ));
    let user = channel.local_user().clone();
    CallEndpoint::builder(channel, media)
        .config(config.clone())
        .observer(Arc::new(LogObserver { user }))
        .spawn()
}

/// Принимает входящие звонки и кладёт трубку через `hang_up_after` после соединения
async fn drive(endpoint: CallEndpoint, hang_up_after: Option<Duration>, once: bool) {
    let mut rx = endpoint.subscribe();
    let mut handled: Option<(SessionId, CallState)> = None;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(session) = snapshot {
            let key = (session.session_id.clone(), session.state);
            if handled.as_ref() != Some(&key) {
                handled = Some(key);
                match session.state {
                    CallState::IncomingRinging => {
                        if let Err(err) = endpoint.accept_call().await {
                            warn!("cannot accept call: {err}");
                        }
                    }
                    CallState::Active => {
                        if let Some(after) = hang_up_after {
                            tokio::time::sleep(after).await;
                            if let Err(err) = endpoint.end_call().await {
                                warn!("cannot end call: {err}");
                            }
                        }
                    }
                    state if state.is_terminal() && once => break,
                    _ => {}
                }
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let args = Args::parse();
    let hold = Duration::from_secs(args.hold);
    let config = match &args.config {
        Some(path) => CallConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => CallConfig::default(),
    };
    let media_kind = if args.video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };

    match args.relay {
        Some(url) => {
            let user = UserId::new(args.user.ok_or("--user is required with --relay")?);
            let (relay, events) = WsRelay::connect(&url, &user).await?;
            let channel = SignalingChannel::start(user, relay, events);
            let endpoint = endpoint(channel, &config);
            match args.call {
                Some(peer) => {
                    endpoint.start_call(UserId::new(peer), media_kind).await?;
                    drive(endpoint, Some(hold), true).await;
                }
                None => drive(endpoint, None, false).await,
            }
        }
        None => {
            let relay = LoopbackRelay::new();
            let caller_id = UserId::new("alice");
            let callee_id = UserId::new("bob");

            let (link, events) = relay.connect(&callee_id);
            let callee = endpoint(
                SignalingChannel::start(callee_id.clone(), link, events),
                &config,
            );
            let (link, events) = relay.connect(&caller_id);
            let caller = endpoint(SignalingChannel::start(caller_id, link, events), &config);

            let answering = tokio::spawn(drive(callee, None, true));
            caller.start_call(callee_id, media_kind).await?;
            drive(caller, Some(hold), true).await;
            answering.await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_demo_needs_no_flags() {
        let args = Args::try_parse_from(["ssc-call"]).unwrap();
        assert!(args.relay.is_none());
        assert!(!args.video);
        assert_eq!(args.hold, 10);
    }

    #[test]
    fn relay_mode_parses_peer_and_media() {
        let args = Args::try_parse_from([
            "ssc-call", "--relay", "wss://relay.example.org", "--user", "alice", "--call",
            "bob", "--video", "--hold", "3",
        ])
        .unwrap();
        assert_eq!(args.relay.as_deref(), Some("wss://relay.example.org"));
        assert_eq!(args.user.as_deref(), Some("alice"));
        assert_eq!(args.call.as_deref(), Some("bob"));
        assert!(args.video);
        assert_eq!(args.hold, 3);
    }

    #[test]
    fn bad_flags_are_refused() {
        assert!(Args::try_parse_from(["ssc-call", "--hold", "soon"]).is_err());
        assert!(Args::try_parse_from(["ssc-call", "--relay", "ws://r"]).is_err());
        assert!(Args::try_parse_from(["ssc-call", "--call", "bob"]).is_err());
        assert!(Args::try_parse_from(["ssc-call", "--ring"]).is_err());
    }
}
