//! WebSocket-клиент relay-сервера.

use crate::error::SignalingError;
use crate::session::UserId;
use crate::signaling::channel::{RelayEvent, RelayTransport};
use crate::signaling::messages::Envelope;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

const HEARTBEAT: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Кадры между клиентом и relay
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFrame {
    Register {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    Signal {
        envelope: Envelope,
    },
    Ping,
    Pong,
}

/// Клиент relay. После обрыва переподключается с экспоненциальной паузой,
/// заново регистрируется и сообщает `RelayEvent::Reconnected`. Кадры,
/// отправленные во время обрыва, теряются.
pub struct WsRelay {
    send_tx: mpsc::UnboundedSender<RelayFrame>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Как закончилась одна WebSocket-сессия
enum Session {
    Lost,
    Shutdown,
}

impl WsRelay {
    /// Подключается, регистрирует пользователя и возвращает поток входящих событий.
    /// Ошибка первого подключения возвращается сразу, без повторов.
    pub async fn connect(
        relay_url: &str,
        user: &UserId,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), SignalingError> {
        let url = derive_websocket_url(relay_url)?;
        let ws = open(&url)
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;

        let (send_tx, send_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let supervisor = tokio::spawn(supervise(url, user.clone(), ws, send_rx, event_tx));

        let relay = Arc::new(Self {
            send_tx,
            tasks: Mutex::new(vec![supervisor]),
        });
        Ok((relay, event_rx))
    }
}

async fn open(url: &Url) -> Result<WsStream, WsError> {
    let (ws, _) = connect_async(url.as_str()).await?;
    debug!(url = %url, "signaling websocket connected");
    Ok(ws)
}

/// Держит соединение живым: обслуживает сессию, после обрыва подключается заново
async fn supervise(
    url: Url,
    user: UserId,
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<RelayFrame>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    loop {
        match serve(ws, &user, &mut outgoing, &events).await {
            Session::Shutdown => return,
            Session::Lost => {}
        }
        if events.send(RelayEvent::Disconnected).is_err() {
            return;
        }

        let mut attempt = 0;
        ws = loop {
            let delay = reconnect_delay(attempt);
            debug!(attempt, ?delay, "relay reconnect scheduled");
            tokio::time::sleep(delay).await;
            match open(&url).await {
                Ok(ws) => break ws,
                Err(err) => {
                    warn!(attempt, "relay reconnect failed: {err}");
                    attempt = attempt.saturating_add(1);
                }
            }
        };

        // всё, что успело встать в очередь во время обрыва, уже неактуально
        let mut dropped = 0;
        while outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "frames queued during outage dropped");
        }
        info!(url = %url, "relay connection restored");
        if events.send(RelayEvent::Reconnected).is_err() {
            return;
        }
    }
}

/// Одна WebSocket-сессия: регистрация, пересылка кадров в обе стороны, heartbeat
async fn serve(
    ws: WsStream,
    user: &UserId,
    outgoing: &mut mpsc::UnboundedReceiver<RelayFrame>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> Session {
    let (mut ws_write, mut ws_read) = ws.split();
    let register = RelayFrame::Register {
        user_id: user.clone(),
    };
    if !write(&mut ws_write, &register).await {
        return Session::Lost;
    }

    let mut ticker = tokio::time::interval(HEARTBEAT);
    ticker.tick().await;
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_write.close().await;
                    return Session::Shutdown;
                };
                if !write(&mut ws_write, &frame).await {
                    return Session::Lost;
                }
            }
            _ = ticker.tick() => {
                if !write(&mut ws_write, &RelayFrame::Ping).await {
                    return Session::Lost;
                }
            }
            msg = ws_read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => return Session::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        return Session::Lost;
                    }
                };
                trace!(len = text.len(), "ws in");
                match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(RelayFrame::Signal { envelope }) => {
                        if events.send(RelayEvent::Frame(envelope)).is_err() {
                            return Session::Shutdown;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("unparseable relay frame dropped: {err}"),
                }
            }
        }
    }
}

async fn write<S>(sink: &mut S, frame: &RelayFrame) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!("cannot encode relay frame: {err}");
            true
        }
    }
}

/// Пауза перед попыткой `attempt` (с нуля): 0.5 с, удваивается, не больше 30 с
pub fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(RECONNECT_MAX, |delay| delay.min(RECONNECT_MAX))
}

#[async_trait]
impl RelayTransport for WsRelay {
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.send_tx
            .send(RelayFrame::Signal { envelope })
            .map_err(|_| SignalingError::Disconnected)
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

/// http(s) → ws(s); ws(s) оставляем как есть
pub fn derive_websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(raw).map_err(|err| SignalingError::Transport(format!("bad relay url: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported relay scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Transport("cannot rewrite relay scheme".into()))?;
    Ok(url)
}
