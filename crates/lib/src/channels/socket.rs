//! Persistent WebSocket channel.
//!
//! One connection per client. A reader task owns the read half and forwards
//! text frames; `send` writes one request and waits for the first frame that
//! is not a heartbeat. The keep-alive loop pings on a fixed interval and
//! reconnects with the backoff budget when the connection is found closed.

use crate::adapter::is_heartbeat_frame;
use crate::backoff::Backoff;
use crate::config::Config;
use crate::protocol::{Handshake, SocketRequest};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, Message>;
type WsStream = SplitStream<Ws>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("websocket connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("websocket connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket client is shut down")]
    ShutDown,
}

impl SocketError {
    /// The connection died under us; worth one reconnect-and-retry.
    fn is_connection_loss(&self) -> bool {
        matches!(self, SocketError::Closed | SocketError::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Never connected, closed, or reconnect budget exhausted. The next send connects.
    Idle,
    Connected,
    /// Closure detected; the keep-alive loop reconnects.
    Lost,
}

struct Inner {
    url: String,
    user_id: String,
    model_id: String,
    handshake_timeout: Duration,
    reply_timeout: Duration,
    ping_interval: Duration,
    backoff: Backoff,
    sink: Mutex<Option<WsSink>>,
    /// Text frames from the current connection's reader task. Lock order: frames, then sink.
    frames: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    session_id: RwLock<Option<String>>,
    state: StdMutex<LinkState>,
    generation: AtomicU64,
    lost: Notify,
    cancel: CancellationToken,
}

/// Cloneable handle to the session's WebSocket connection.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<Inner>,
}

impl SocketClient {
    pub fn new(config: &Config, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: config.socket_url(),
                user_id: config.identity.user_id.clone(),
                model_id: config.identity.model_id.clone(),
                handshake_timeout: Duration::from_secs(config.socket.handshake_timeout_secs),
                reply_timeout: Duration::from_secs(config.socket.reply_timeout_secs.max(1)),
                ping_interval: Duration::from_secs(config.socket.ping_interval_secs.max(1)),
                backoff: Backoff::from_config(&config.reconnect),
                sink: Mutex::new(None),
                frames: Mutex::new(None),
                session_id: RwLock::new(None),
                state: StdMutex::new(LinkState::Idle),
                generation: AtomicU64::new(0),
                lost: Notify::new(),
                cancel,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Server-assigned session id from the last handshake.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().await.clone()
    }

    fn state(&self) -> LinkState {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: LinkState) {
        let mut g = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if *g != next {
            log::info!("socket: {:?} -> {:?}", *g, next);
            *g = next;
        }
    }

    /// Move `from` -> `to` only if the state is still `from`.
    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        let mut g = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if *g != from {
            return false;
        }
        log::info!("socket: {:?} -> {:?}", from, to);
        *g = to;
        true
    }

    /// Connect unless already connected.
    pub async fn connect(&self) -> Result<(), SocketError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SocketError::ShutDown);
        }
        let mut frames = self.inner.frames.lock().await;
        if self.is_connected() && frames.is_some() {
            return Ok(());
        }
        let mut sink = self.inner.sink.lock().await;
        self.open(&mut frames, &mut sink).await
    }

    async fn open(
        &self,
        frames_slot: &mut Option<mpsc::UnboundedReceiver<String>>,
        sink_slot: &mut Option<WsSink>,
    ) -> Result<(), SocketError> {
        let inner = &self.inner;
        if let Some(old) = sink_slot.take() {
            close_sink(old).await;
        }
        *frames_slot = None;

        log::info!("socket: connecting to {}", inner.url);
        let (ws, _) = connect_async(inner.url.as_str())
            .await
            .map_err(|source| SocketError::Connect {
                url: inner.url.clone(),
                source,
            })?;
        let (sink, mut stream) = ws.split();

        let mut late_handshake = false;
        let session_id = match tokio::time::timeout(inner.handshake_timeout, next_text(&mut stream)).await {
            Ok(Ok(first)) => {
                let id = Handshake::session_id(&first);
                if id.is_none() {
                    log::debug!("socket: first frame is not a successful handshake: {}", first);
                }
                id
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                log::warn!("socket: no handshake frame within {:?}", inner.handshake_timeout);
                late_handshake = true;
                None
            }
        };
        if let Some(ref id) = session_id {
            log::info!("socket: session id {}", id);
        }
        *inner.session_id.write().await = session_id;

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(self.clone(), stream, tx, generation, late_handshake));
        *frames_slot = Some(rx);
        *sink_slot = Some(sink);
        self.set_state(LinkState::Connected);
        Ok(())
    }

    /// Send one query and return the first non-heartbeat text frame.
    /// Connects first when needed; a connection lost mid-exchange is
    /// re-established and the query retried once. Waiting for the reply is
    /// bounded by the reply timeout, after which the connection is dropped.
    pub async fn send(&self, query: &str) -> Result<String, SocketError> {
        match self.exchange(query).await {
            Err(e) if e.is_connection_loss() => {
                log::warn!("socket: {}; reconnecting and retrying once", e);
                self.drop_link(LinkState::Idle).await;
                self.exchange(query).await
            }
            other => other,
        }
    }

    async fn exchange(&self, query: &str) -> Result<String, SocketError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SocketError::ShutDown);
        }
        let mut frames_slot = self.inner.frames.lock().await;
        if !self.is_connected() || frames_slot.is_none() {
            let mut sink_slot = self.inner.sink.lock().await;
            self.open(&mut frames_slot, &mut sink_slot).await?;
        }

        let request = SocketRequest {
            query: query.to_string(),
            user_id: self.inner.user_id.clone(),
            model_id: self.inner.model_id.clone(),
            session_id: self.session_id().await,
        };
        let text = serde_json::to_string(&request)?;
        {
            let mut sink_slot = self.inner.sink.lock().await;
            let sink = sink_slot.as_mut().ok_or(SocketError::Closed)?;
            sink.send(Message::Text(text)).await?;
        }

        let frames = frames_slot.as_mut().ok_or(SocketError::Closed)?;
        let reply = tokio::time::timeout(self.inner.reply_timeout, next_reply(frames)).await;
        match reply {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(SocketError::Closed),
            Err(_) => {
                log::warn!(
                    "socket: no reply within {:?}; dropping the connection",
                    self.inner.reply_timeout
                );
                // A late reply must not answer the next request.
                *frames_slot = None;
                if let Some(old) = self.inner.sink.lock().await.take() {
                    close_sink(old).await;
                }
                self.set_state(LinkState::Idle);
                Err(SocketError::Timeout(self.inner.reply_timeout))
            }
        }
    }

    async fn ping(&self) -> Result<(), SocketError> {
        let mut sink_slot = self.inner.sink.lock().await;
        let sink = sink_slot.as_mut().ok_or(SocketError::Closed)?;
        sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// Tear down the current connection (if any) and move to `next`.
    async fn drop_link(&self, next: LinkState) {
        let mut frames = self.inner.frames.lock().await;
        let mut sink = self.inner.sink.lock().await;
        *frames = None;
        if let Some(old) = sink.take() {
            close_sink(old).await;
        }
        self.set_state(next);
    }

    /// Called by a reader task when its connection ends.
    fn connection_lost(&self, generation: u64) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if self.inner.generation.load(Ordering::SeqCst) == generation
            && self.transition(LinkState::Connected, LinkState::Lost)
        {
            log::warn!("socket: connection closed unexpectedly");
            self.inner.lost.notify_one();
        }
    }

    /// Reconnect with the backoff budget. On exhaustion the client goes idle
    /// and the next `send` tries again.
    async fn reconnect(&self, cancel: &CancellationToken) -> bool {
        let backoff = self.inner.backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if backoff.exhausted(attempt) {
                log::error!(
                    "socket: giving up after {} reconnect attempts; the next send will try again",
                    backoff.max_attempts
                );
                self.transition(LinkState::Lost, LinkState::Idle);
                return false;
            }
            log::info!(
                "socket: reconnecting in {:?} (attempt {}/{})",
                backoff.delay_for(attempt),
                attempt,
                backoff.max_attempts
            );
            if !backoff.wait(attempt, cancel).await {
                return false;
            }
            match self.connect().await {
                Ok(()) => return true,
                Err(e) => log::warn!("socket: reconnect failed: {}", e),
            }
        }
    }

    /// Start the keep-alive loop. It stops when the client's token is cancelled.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.keepalive().await })
    }

    async fn keepalive(&self) {
        let cancel = self.inner.cancel.clone();
        let mut ticker = tokio::time::interval(self.inner.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.inner.lost.notified() => {}
            }
            match self.state() {
                LinkState::Idle => {}
                LinkState::Connected => {
                    let generation = self.inner.generation.load(Ordering::SeqCst);
                    if let Err(e) = self.ping().await {
                        log::warn!("socket: keep-alive ping failed: {}", e);
                        self.connection_lost(generation);
                    }
                }
                LinkState::Lost => {
                    self.reconnect(&cancel).await;
                }
            }
        }
        log::debug!("socket: keep-alive loop stopped");
    }

    /// Stop the keep-alive loop and reader, close the socket, forget the session id.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.drop_link(LinkState::Idle).await;
        *self.inner.session_id.write().await = None;
        log::info!("socket: closed");
    }
}

/// Next queued frame that is not a heartbeat; `None` once the reader is gone.
async fn next_reply(frames: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    while let Some(frame) = frames.recv().await {
        if is_heartbeat_frame(&frame) {
            log::debug!("socket: heartbeat frame, still waiting for the reply");
            continue;
        }
        return Some(frame);
    }
    None
}

/// First text frame, skipping control frames.
async fn next_text(stream: &mut WsStream) -> Result<String, SocketError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(t) => return Ok(t),
            Message::Close(_) => return Err(SocketError::Closed),
            _ => continue,
        }
    }
    Err(SocketError::Closed)
}

async fn read_frames(
    client: SocketClient,
    mut stream: WsStream,
    tx: mpsc::UnboundedSender<String>,
    generation: u64,
    mut late_handshake: bool,
) {
    let cancel = client.inner.cancel.clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            n = stream.next() => n,
        };
        match next {
            Some(Ok(Message::Text(t))) => {
                // After a handshake timeout the handshake may still arrive first.
                if std::mem::take(&mut late_handshake) {
                    if let Some(id) = Handshake::session_id(&t) {
                        log::info!("socket: late handshake, session id {}", id);
                        if client.inner.generation.load(Ordering::SeqCst) == generation {
                            *client.inner.session_id.write().await = Some(id);
                        }
                        continue;
                    }
                }
                if tx.send(t).is_err() {
                    // Receiver replaced by a newer connection or dropped on close.
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                log::info!("socket: server closed the connection: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("socket: read error: {}", e);
                break;
            }
            None => break,
        }
    }
    client.connection_lost(generation);
}

async fn close_sink(mut sink: WsSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("socket: close: {}", e),
        Err(_) => log::debug!("socket: close timed out"),
    }
}
