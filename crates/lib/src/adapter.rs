//! Reply adapter: turns whatever a reply channel delivers (HTTP body, queue
//! message, socket frame) into exactly one transcript line, or drops it when
//! it is a heartbeat.
//!
//! Structured payloads are JSON objects with no fixed schema. The display text
//! is found by walking [`EXTRACTORS`] in order; the first one that matches wins
//! and the record's JSON text is the last resort. Adapting never fails: decode
//! problems become an error line instead of propagating to the caller.

use serde::Serialize;
use serde_json::{Map, Value};

/// Shown by the responder when a socket reply is successful but carries no text.
pub const NO_ANSWER_TEXT: &str = "Sorry, I have no answer to give.";

const UNKNOWN_ERROR: &str = "unknown error";

/// Agent name the socket backend uses for its default responder.
const GENERIC_AGENT_NAME: &str = "Agent";

type Record = Map<String, Value>;

/// A reply as delivered by a channel, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// Already-final display text.
    Text(String),
    /// A JSON object.
    Record(Record),
}

impl InboundPayload {
    /// JSON objects become records. A JSON string literal is unwrapped; anything
    /// else (non-JSON, numbers, arrays) is kept as the raw text.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self::Record(map),
            Ok(Value::String(s)) => Self::Text(s),
            _ => Self::Text(raw.to_string()),
        }
    }
}

/// Who a transcript line is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Speaker {
    User(String),
    Responder(String),
    System,
    Error,
}

/// One rendered chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayEvent {
    pub text: String,
    pub speaker: Speaker,
}

impl DisplayEvent {
    pub fn new(text: impl Into<String>, speaker: Speaker) -> Self {
        Self {
            text: text.into(),
            speaker,
        }
    }

    pub fn user(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(text, Speaker::User(name.into()))
    }

    pub fn responder(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(text, Speaker::Responder(name.into()))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(text, Speaker::System)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, Speaker::Error)
    }
}

/// Result of adapting one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adapted {
    Display(DisplayEvent),
    /// Keep-alive frame; nothing to show.
    Heartbeat,
}

impl Adapted {
    pub fn into_event(self) -> Option<DisplayEvent> {
        match self {
            Adapted::Display(e) => Some(e),
            Adapted::Heartbeat => None,
        }
    }
}

/// How strictly the `status` envelope is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvelopePolicy {
    /// HTTP and queue replies: the status rule only applies when `status` is present.
    #[default]
    Lenient,
    /// Socket replies: a missing status is a failure, and a success without text
    /// shows [`NO_ANSWER_TEXT`].
    Strict,
}

#[derive(Debug, thiserror::Error)]
pub enum AdaptError {
    #[error("message body is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),
}

/// Text found by an extractor, plus the agent name when the payload names one.
#[derive(Debug)]
struct Hit {
    text: String,
    agent: Option<String>,
}

impl Hit {
    fn plain(text: String) -> Self {
        Self { text, agent: None }
    }
}

type Extractor = fn(&Record) -> Option<Hit>;

/// Display-text resolution order. First match wins.
const EXTRACTORS: &[(&str, Extractor)] = &[
    ("content", from_content),
    ("result", from_result),
    ("message", from_message),
    ("data.response", from_data_response),
    ("metadata.original_request", from_original_request),
];

/// Display text for a field value. Null, blank strings and empty containers
/// count as absent; other scalars and containers render as JSON text.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn from_content(r: &Record) -> Option<Hit> {
    r.get("content").and_then(text_of).map(Hit::plain)
}

fn from_result(r: &Record) -> Option<Hit> {
    let result = r.get("result")?;
    let nested = result
        .as_object()
        .and_then(|inner| inner.get("content"))
        .and_then(text_of);
    nested.or_else(|| text_of(result)).map(Hit::plain)
}

fn from_message(r: &Record) -> Option<Hit> {
    r.get("message").and_then(text_of).map(Hit::plain)
}

fn from_data_response(r: &Record) -> Option<Hit> {
    let data = r.get("data")?.as_object()?;
    let text = data.get("response").and_then(text_of)?;
    let agent = data
        .get("agent")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    Some(Hit { text, agent })
}

fn from_original_request(r: &Record) -> Option<Hit> {
    if !r.contains_key("message_type") {
        return None;
    }
    r.get("metadata")?
        .get("original_request")
        .and_then(text_of)
        .map(Hit::plain)
}

fn is_heartbeat(r: &Record) -> bool {
    matches!(
        r.get("type").and_then(Value::as_str),
        Some("ping") | Some("pong")
    )
}

/// True for a raw frame shaped like `{"type": "ping"}`.
pub fn is_heartbeat_frame(raw: &str) -> bool {
    matches!(InboundPayload::parse(raw), InboundPayload::Record(r) if is_heartbeat(&r))
}

/// Maps payloads to display events under a configured responder name.
#[derive(Debug, Clone)]
pub struct ReplyAdapter {
    responder: String,
}

impl ReplyAdapter {
    pub fn new(responder: impl Into<String>) -> Self {
        Self {
            responder: responder.into(),
        }
    }

    pub fn responder(&self) -> &str {
        &self.responder
    }

    /// Adapt a raw body (queue message). Never fails.
    pub fn adapt_bytes(&self, body: &[u8], policy: EnvelopePolicy) -> Adapted {
        match self.try_adapt_bytes(body, policy) {
            Ok(adapted) => adapted,
            Err(e) => {
                log::error!("reply adapter: {}", e);
                Adapted::Display(DisplayEvent::error(format!("Processing error: {}", e)))
            }
        }
    }

    fn try_adapt_bytes(&self, body: &[u8], policy: EnvelopePolicy) -> Result<Adapted, AdaptError> {
        let raw = std::str::from_utf8(body)?;
        Ok(self.adapt_str(raw, policy))
    }

    /// Adapt a text body (HTTP response, socket frame).
    pub fn adapt_str(&self, raw: &str, policy: EnvelopePolicy) -> Adapted {
        self.adapt(InboundPayload::parse(raw), policy)
    }

    pub fn adapt(&self, payload: InboundPayload, policy: EnvelopePolicy) -> Adapted {
        match payload {
            InboundPayload::Text(text) => {
                if text.trim().is_empty() {
                    Adapted::Display(self.reply(NO_ANSWER_TEXT))
                } else {
                    Adapted::Display(self.reply(text))
                }
            }
            InboundPayload::Record(record) => self.adapt_record(&record, policy),
        }
    }

    fn adapt_record(&self, record: &Record, policy: EnvelopePolicy) -> Adapted {
        if is_heartbeat(record) {
            log::debug!("reply adapter: dropping heartbeat frame");
            return Adapted::Heartbeat;
        }

        let success = match (record.get("status"), policy) {
            (Some(Value::String(s)), _) => s == "success",
            (None, EnvelopePolicy::Lenient) => true,
            (Some(_), _) | (None, EnvelopePolicy::Strict) => false,
        };
        if !success {
            let message = record
                .get("message")
                .and_then(text_of)
                .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
            return Adapted::Display(DisplayEvent::error(format!("Error: {}", message)));
        }

        for (name, extract) in EXTRACTORS {
            if let Some(hit) = extract(record) {
                log::debug!("reply adapter: display text from `{}`", name);
                let speaker = self.speaker_for(hit.agent.as_deref());
                return Adapted::Display(DisplayEvent::new(hit.text, speaker));
            }
        }

        let text = match policy {
            EnvelopePolicy::Lenient => Value::Object(record.clone()).to_string(),
            EnvelopePolicy::Strict => NO_ANSWER_TEXT.to_string(),
        };
        Adapted::Display(self.reply(text))
    }

    fn speaker_for(&self, agent: Option<&str>) -> Speaker {
        match agent {
            Some(a) if a != GENERIC_AGENT_NAME => Speaker::Responder(a.to_string()),
            _ => Speaker::Responder(self.responder.clone()),
        }
    }

    fn reply(&self, text: impl Into<String>) -> DisplayEvent {
        DisplayEvent::responder(self.responder.clone(), text)
    }
}

/// Lenient adaptation under the default responder name; `None` only for heartbeats.
pub fn extract_display(payload: InboundPayload) -> Option<DisplayEvent> {
    ReplyAdapter::new("Assistant")
        .adapt(payload, EnvelopePolicy::Lenient)
        .into_event()
}
