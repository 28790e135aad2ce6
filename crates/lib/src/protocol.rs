//! Wire types for the outbound ask request and the WebSocket frames.

use serde::{Deserialize, Serialize};

/// Ask request: sent as URL query parameters or as a JSON body `{ query, model_id, user_id }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub query: String,
    pub model_id: String,
    pub user_id: String,
}

/// Socket request frame: `{ query, user_id, model_id, session_id? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketRequest {
    pub query: String,
    pub user_id: String,
    pub model_id: String,
    /// Server-assigned id from the connect handshake, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// First frame the socket server sends after connect:
/// `{ "status": "success", "data": { "session_id": "..." } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Option<HandshakeData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeData {
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Handshake {
    /// Session id from a successful handshake frame; `None` for anything else.
    pub fn session_id(raw: &str) -> Option<String> {
        let hs: Handshake = serde_json::from_str(raw).ok()?;
        if hs.status.as_deref() != Some("success") {
            return None;
        }
        hs.data?
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Query text for the agent switch command understood by the socket backend.
pub fn switch_agent_query(agent: &str) -> String {
    format!("switch_agent {}", agent.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_request_omits_unknown_session() {
        let req = SocketRequest {
            query: "hi".to_string(),
            user_id: "u".to_string(),
            model_id: "m".to_string(),
            session_id: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, serde_json::json!({ "query": "hi", "user_id": "u", "model_id": "m" }));
    }

    #[test]
    fn handshake_session_id() {
        assert_eq!(
            Handshake::session_id(r#"{"status":"success","data":{"session_id":"s-1"}}"#),
            Some("s-1".to_string())
        );
        assert_eq!(
            Handshake::session_id(r#"{"status":"error","data":{"session_id":"s-1"}}"#),
            None
        );
        assert_eq!(Handshake::session_id("hello"), None);
        assert_eq!(Handshake::session_id(r#"{"status":"success"}"#), None);
    }
}
