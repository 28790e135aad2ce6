//! Asynchronous reply channel: a background consumer on a durable broker queue.
//!
//! Messages are consumed with auto-ack; each body goes through the reply
//! adapter into the transcript. The supervisor resubscribes with backoff when
//! the stream is lost and goes dormant once the budget is spent, until the
//! next user submission wakes it or the session is cancelled. The budget only
//! resets once a subscription has delivered a message.

use crate::adapter::{Adapted, EnvelopePolicy, ReplyAdapter};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::transcript::Transcript;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONSUMER_TAG: &str = "chatrelay";

/// Message bodies in delivery order. Ends (or yields an error) when the subscription is lost.
pub type MessageStream = BoxStream<'static, Result<Vec<u8>, QueueError>>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("queue stream error: {0}")]
    Stream(String),
}

/// Where queue messages come from.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Short description for logs (must not contain credentials).
    fn describe(&self) -> String;

    /// Connect and start consuming.
    async fn subscribe(&self) -> Result<MessageStream, QueueError>;
}

/// AMQP 0-9-1 source (RabbitMQ) backed by `lapin`.
pub struct AmqpSource {
    uri: String,
    host: String,
    port: u16,
    queue: String,
}

impl AmqpSource {
    pub fn new(config: &Config) -> Self {
        Self {
            uri: config.broker_uri(),
            host: config.broker.host.clone(),
            port: config.broker.port,
            queue: config.broker.queue.clone(),
        }
    }
}

#[async_trait]
impl QueueSource for AmqpSource {
    fn describe(&self) -> String {
        format!("queue `{}` on {}:{}", self.queue, self.host, self.port)
    }

    async fn subscribe(&self) -> Result<MessageStream, QueueError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let consumer = channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Connection and channel live as long as the stream.
        let state = (connection, channel, Box::pin(consumer));
        let messages = stream::unfold(state, |(connection, channel, mut consumer)| async move {
            let item = consumer
                .next()
                .await?
                .map(|delivery| delivery.data)
                .map_err(QueueError::from);
            Some((item, (connection, channel, consumer)))
        });
        Ok(messages.boxed())
    }
}

/// Handle to the running queue supervisor. Dropping it does not stop the task;
/// cancel the token it was spawned with.
pub struct QueueConsumer {
    dormant: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl QueueConsumer {
    pub fn spawn(
        source: Arc<dyn QueueSource>,
        adapter: ReplyAdapter,
        transcript: Transcript,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        let dormant = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let supervisor = Supervisor {
            source,
            adapter,
            transcript,
            backoff,
            cancel,
            dormant: dormant.clone(),
            wake: wake.clone(),
        };
        let handle = tokio::spawn(supervisor.run());
        Self {
            dormant,
            wake,
            handle,
        }
    }

    /// Restart a consumer that gave up reconnecting. No-op otherwise.
    pub fn wake(&self) {
        if self.dormant.load(Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    pub fn is_dormant(&self) -> bool {
        self.dormant.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

struct Supervisor {
    source: Arc<dyn QueueSource>,
    adapter: ReplyAdapter,
    transcript: Transcript,
    backoff: Backoff,
    cancel: CancellationToken,
    dormant: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Supervisor {
    async fn run(self) {
        let source = self.source.describe();
        let mut attempt: u32 = 0;
        'supervise: loop {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break 'supervise,
                r = self.source.subscribe() => r,
            };
            match subscribed {
                Ok(mut messages) => {
                    log::info!("queue: consuming from {}", source);
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => break 'supervise,
                            n = messages.next() => n,
                        };
                        match next {
                            Some(Ok(body)) => {
                                attempt = 0;
                                self.deliver(&body).await;
                            }
                            Some(Err(e)) => {
                                log::warn!("queue: lost {}: {}", source, e);
                                break;
                            }
                            None => {
                                log::warn!("queue: subscription to {} ended", source);
                                break;
                            }
                        }
                    }
                }
                Err(e) => log::warn!("queue: subscribing to {} failed: {}", source, e),
            }

            attempt = attempt.saturating_add(1);
            if self.backoff.exhausted(attempt) {
                log::error!(
                    "queue: giving up on {} after {} reconnect attempts; waiting for the next submission",
                    source,
                    self.backoff.max_attempts
                );
                self.dormant.store(true, Ordering::SeqCst);
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'supervise,
                    _ = self.wake.notified() => {}
                }
                self.dormant.store(false, Ordering::SeqCst);
                log::info!("queue: woken up, reconnecting to {}", source);
                attempt = 0;
                continue;
            }
            log::info!(
                "queue: reconnecting in {:?} (attempt {}/{})",
                self.backoff.delay_for(attempt),
                attempt,
                self.backoff.max_attempts
            );
            if !self.backoff.wait(attempt, &self.cancel).await {
                break;
            }
        }
        log::debug!("queue: consumer stopped");
    }

    async fn deliver(&self, body: &[u8]) {
        match self.adapter.adapt_bytes(body, EnvelopePolicy::Lenient) {
            Adapted::Display(event) => {
                self.transcript.append(event).await;
            }
            Adapted::Heartbeat => log::debug!("queue: heartbeat message dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Speaker;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    type Round = Result<Vec<Result<Vec<u8>, QueueError>>, QueueError>;

    /// Plays back one scripted round per subscribe; fails once the script is empty.
    struct ScriptedSource {
        rounds: Mutex<VecDeque<Round>>,
        subscribes: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(rounds: Vec<Round>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
                subscribes: AtomicUsize::new(0),
            })
        }

        fn subscribes(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueueSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted queue".to_string()
        }

        async fn subscribe(&self) -> Result<MessageStream, QueueError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let round = self.rounds.lock().unwrap().pop_front();
            match round {
                Some(Ok(items)) => Ok(stream::iter(items).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(QueueError::Stream("broker unreachable".to_string())),
            }
        }
    }

    fn fast_backoff(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
        for _ in 0..400 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn delivers_messages_and_drops_heartbeats() {
        let source = ScriptedSource::new(vec![Ok(vec![
            Ok(br#"{"content":"hello"}"#.to_vec()),
            Ok(br#"{"type":"ping"}"#.to_vec()),
            Ok(b"plain text".to_vec()),
        ])]);
        let transcript = Transcript::new();
        let cancel = CancellationToken::new();
        let consumer = QueueConsumer::spawn(
            source.clone(),
            ReplyAdapter::new("Myboun"),
            transcript.clone(),
            fast_backoff(0),
            cancel.clone(),
        );

        wait_until("dormant consumer", || consumer.is_dormant()).await;
        let snap = transcript.snapshot().await;
        let texts: Vec<&str> = snap.iter().map(|e| e.event.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "plain text"]);
        assert!(snap
            .iter()
            .all(|e| e.event.speaker == Speaker::Responder("Myboun".to_string())));
        cancel.cancel();
    }

    #[tokio::test]
    async fn retries_with_budget_then_wakes_on_demand() {
        let source = ScriptedSource::new(Vec::new());
        let cancel = CancellationToken::new();
        let consumer = QueueConsumer::spawn(
            source.clone(),
            ReplyAdapter::new("Assistant"),
            Transcript::new(),
            fast_backoff(2),
            cancel.clone(),
        );

        wait_until("first give-up", || consumer.is_dormant()).await;
        assert_eq!(source.subscribes(), 3);

        consumer.wake();
        wait_until("second round", || source.subscribes() == 6).await;
        wait_until("second give-up", || consumer.is_dormant()).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn stream_error_triggers_resubscribe() {
        let source = ScriptedSource::new(vec![
            Ok(vec![
                Ok(br#"{"result":"one"}"#.to_vec()),
                Err(QueueError::Stream("connection reset".to_string())),
            ]),
            Ok(vec![Ok(br#"{"result":{"content":"two"}}"#.to_vec())]),
        ]);
        let transcript = Transcript::new();
        let cancel = CancellationToken::new();
        let _consumer = QueueConsumer::spawn(
            source.clone(),
            ReplyAdapter::new("Assistant"),
            transcript.clone(),
            fast_backoff(3),
            cancel.clone(),
        );

        for _ in 0..400 {
            if transcript.len().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let texts: Vec<String> = transcript
            .snapshot()
            .await
            .into_iter()
            .map(|e| e.event.text)
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_subscriptions_spend_the_budget() {
        let rounds: Vec<Round> = (0..50).map(|_| Ok(Vec::new())).collect();
        let source = ScriptedSource::new(rounds);
        let cancel = CancellationToken::new();
        let consumer = QueueConsumer::spawn(
            source.clone(),
            ReplyAdapter::new("Assistant"),
            Transcript::new(),
            fast_backoff(2),
            cancel.clone(),
        );

        wait_until("dormant consumer", || consumer.is_dormant()).await;
        assert_eq!(source.subscribes(), 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_stops_the_supervisor() {
        let source = ScriptedSource::new(Vec::new());
        let cancel = CancellationToken::new();
        let consumer = QueueConsumer::spawn(
            source,
            ReplyAdapter::new("Assistant"),
            Transcript::new(),
            Backoff {
                max_attempts: 10,
                initial: Duration::from_secs(60),
                max: Duration::from_secs(60),
            },
            cancel.clone(),
        );
        cancel.cancel();
        wait_until("supervisor exit", || consumer.is_finished()).await;
    }
}
