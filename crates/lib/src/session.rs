//! Chat session: the one object that owns the identity, the transcript and
//! every reply channel for the lifetime of the process.
//!
//! Built once at start, handed to the front end, torn down with `shutdown`.

use crate::adapter::{Adapted, DisplayEvent, EnvelopePolicy, ReplyAdapter, Speaker};
use crate::backoff::Backoff;
use crate::channels::{HttpChannel, QueueConsumer, QueueSource, SocketClient};
use crate::config::{Config, DisplayConfig};
use crate::protocol::{switch_agent_query, AskRequest};
use crate::transcript::{EntryId, SpeakerNames, Transcript};
use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Who is talking, and to which model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub model_id: String,
}

/// Which synchronous channel a submission goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Route {
    /// POST to the ask endpoint.
    #[default]
    Http,
    /// Frame over the persistent WebSocket.
    Socket,
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Route::Http),
            "socket" | "ws" | "websocket" => Ok(Route::Socket),
            other => Err(format!("unknown route {:?} (expected http or socket)", other)),
        }
    }
}

/// Connection overview for the status command.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub socket_connected: bool,
    pub socket_session_id: Option<String>,
    /// `None` when no queue consumer was started.
    pub queue_dormant: Option<bool>,
    pub transcript_len: usize,
}

pub struct ChatSession {
    identity: Identity,
    display: DisplayConfig,
    backoff: Backoff,
    transcript: Transcript,
    adapter: ReplyAdapter,
    http: HttpChannel,
    socket: SocketClient,
    queue: Option<QueueConsumer>,
    keepalive: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ChatSession {
    pub fn new(config: &Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let http = HttpChannel::new(&config.endpoint).context("building HTTP client")?;
        Ok(Self {
            identity: Identity {
                user_id: config.identity.user_id.clone(),
                model_id: config.identity.model_id.clone(),
            },
            display: config.display.clone(),
            backoff: Backoff::from_config(&config.reconnect),
            transcript: Transcript::new(),
            adapter: ReplyAdapter::new(config.display.responder.clone()),
            http,
            socket: SocketClient::new(config, cancel.child_token()),
            queue: None,
            keepalive: None,
            cancel,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn speaker_names(&self) -> SpeakerNames {
        SpeakerNames {
            system: self.display.system.clone(),
        }
    }

    /// Post the greeting, start the socket keep-alive and, when given, the queue consumer.
    pub async fn start(&mut self, queue: Option<Arc<dyn QueueSource>>) {
        if let Some(greeting) = self.display.greeting.as_deref().map(str::trim) {
            if !greeting.is_empty() {
                self.transcript
                    .append(DisplayEvent::responder(self.adapter.responder(), greeting))
                    .await;
            }
        }
        if self.keepalive.is_none() {
            self.keepalive = Some(self.socket.spawn_keepalive());
        }
        if let Some(source) = queue {
            if self.queue.is_none() {
                log::info!("session: starting queue consumer for {}", source.describe());
                self.queue = Some(QueueConsumer::spawn(
                    source,
                    self.adapter.clone(),
                    self.transcript.clone(),
                    self.backoff,
                    self.cancel.child_token(),
                ));
            }
        }
    }

    /// Append the user's line, show a placeholder, ask over `route` and replace
    /// the placeholder with the adapted reply (or one error line).
    /// Returns the id of the reply entry; `None` for blank input or a heartbeat-only reply.
    pub async fn submit(&self, text: &str, route: Route) -> Option<EntryId> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(queue) = &self.queue {
            queue.wake();
        }
        self.transcript
            .append(DisplayEvent::user(self.display.user.clone(), text))
            .await;
        let placeholder = self.transcript.push_placeholder().await;
        let reply = match route {
            Route::Http => self.ask_http(text).await,
            Route::Socket => self.ask_socket(text).await,
        };
        self.transcript.resolve_placeholder(placeholder, reply).await
    }

    async fn ask_http(&self, query: &str) -> Option<DisplayEvent> {
        let request = AskRequest {
            query: query.to_string(),
            model_id: self.identity.model_id.clone(),
            user_id: self.identity.user_id.clone(),
        };
        match self.http.ask(&request).await {
            Ok(body) => self.adapter.adapt_str(&body, EnvelopePolicy::Lenient).into_event(),
            Err(e) => {
                log::warn!("session: ask via {} failed: {}", self.http.url(), e);
                Some(DisplayEvent::error(format!(
                    "Could not reach the language model service: {}",
                    e
                )))
            }
        }
    }

    async fn ask_socket(&self, query: &str) -> Option<DisplayEvent> {
        match self.socket.send(query).await {
            Ok(frame) => self.adapter.adapt_str(&frame, EnvelopePolicy::Strict).into_event(),
            Err(e) => {
                log::warn!("session: socket send failed: {}", e);
                Some(DisplayEvent::error(format!(
                    "Sorry, no valid reply was received: {}",
                    e
                )))
            }
        }
    }

    /// Ask the socket backend to switch agents; posts a system line with the outcome.
    pub async fn switch_agent(&self, agent: &str) -> EntryId {
        let agent = agent.trim();
        let event = match self.socket.send(&switch_agent_query(agent)).await {
            Ok(frame) => match self.adapter.adapt_str(&frame, EnvelopePolicy::Strict) {
                Adapted::Display(DisplayEvent {
                    speaker: Speaker::Error,
                    text,
                }) => DisplayEvent::error(format!("Switching to agent {} failed. {}", agent, text)),
                _ => DisplayEvent::system(format!("Switched to agent {}", agent)),
            },
            Err(e) => {
                log::warn!("session: agent switch failed: {}", e);
                DisplayEvent::error(format!("Switching to agent {} failed: {}", agent, e))
            }
        };
        self.transcript.append(event).await
    }

    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            socket_connected: self.socket.is_connected(),
            socket_session_id: self.socket.session_id().await,
            queue_dormant: self.queue.as_ref().map(QueueConsumer::is_dormant),
            transcript_len: self.transcript.len().await,
        }
    }

    /// Cancel background work and close the socket. The queue consumer is not
    /// awaited; it exits on its own once it observes the cancellation.
    /// Returns false when the keep-alive loop did not stop cleanly in time.
    pub async fn shutdown(mut self) -> bool {
        log::info!("session: shutting down");
        self.cancel.cancel();
        self.socket.close().await;
        let mut stopped = true;
        if let Some(handle) = self.keepalive.take() {
            stopped = match tokio::time::timeout(KEEPALIVE_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    log::warn!("session: keep-alive loop failed: {}", e);
                    false
                }
                Err(_) => {
                    log::warn!("session: keep-alive loop did not stop in time");
                    false
                }
            };
        }
        if let Some(queue) = self.queue.take() {
            log::debug!(
                "session: leaving queue consumer to exit (finished: {})",
                queue.is_finished()
            );
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_parsing() {
        assert_eq!("http".parse::<Route>(), Ok(Route::Http));
        assert_eq!(" WS ".parse::<Route>(), Ok(Route::Socket));
        assert!("carrier-pigeon".parse::<Route>().is_err());
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let session = ChatSession::new(&Config::default()).unwrap();
        assert_eq!(session.submit("   ", Route::Http).await, None);
        assert!(session.transcript().is_empty().await);
    }

    #[tokio::test]
    async fn greeting_is_posted_on_start() {
        let mut config = Config::default();
        config.display.greeting = Some("Hello! How can I help?".to_string());
        let mut session = ChatSession::new(&config).unwrap();
        session.start(None).await;
        let snap = session.transcript().snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(
            snap[0].event,
            DisplayEvent::responder("Assistant", "Hello! How can I help?")
        );
        assert!(session.shutdown().await);
    }
}
