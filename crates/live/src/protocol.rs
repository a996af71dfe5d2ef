//! Live protocol messages.
//!
//! Every message is a JSON object `{"type", "session_id", "data"}`; server
//! messages add an RFC 3339 `timestamp`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{ParseResult, SessionInfo, SettingsPatch};

/// Session id reported on errors raised before any session was named.
pub const UNKNOWN_SESSION: &str = "unknown";

// ──────────────────────────────────────────────
// Inbound
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    GrammarChange { content: String },
    TextChange { content: String },
    SettingsChange(SettingsPatch),
    ForceParse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub session_id: String,
    pub event: ClientEvent,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    session_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentData {
    content: String,
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self, InboundError> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|_| InboundError::InvalidJson)?;
        let envelope: Envelope = serde_json::from_value(value).map_err(invalid)?;
        if envelope.session_id.is_empty() {
            return Err(InboundError::InvalidFormat("session_id must not be empty".into()));
        }

        let event = match envelope.kind.as_str() {
            "grammar_change" => ClientEvent::GrammarChange {
                content: content(envelope.data)?,
            },
            "text_change" => ClientEvent::TextChange {
                content: content(envelope.data)?,
            },
            "settings_change" => {
                let data = match envelope.data {
                    serde_json::Value::Null => serde_json::Value::Object(Default::default()),
                    other => other,
                };
                let patch: SettingsPatch = serde_json::from_value(data).map_err(invalid)?;
                patch
                    .validate()
                    .map_err(|e| InboundError::InvalidFormat(e.to_string()))?;
                ClientEvent::SettingsChange(patch)
            }
            "force_parse" => ClientEvent::ForceParse,
            other => {
                return Err(InboundError::InvalidFormat(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        };

        Ok(ClientMessage {
            session_id: envelope.session_id,
            event,
        })
    }
}

fn content(data: serde_json::Value) -> Result<String, InboundError> {
    serde_json::from_value::<ContentData>(data)
        .map(|d| d.content)
        .map_err(invalid)
}

fn invalid(error: serde_json::Error) -> InboundError {
    InboundError::InvalidFormat(error.to_string())
}

// ──────────────────────────────────────────────
// Outbound
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerBody {
    ParseResult(Arc<ParseResult>),
    ParseError {
        error: String,
        error_type: String,
    },
    SessionInfo(SessionInfo),
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub body: ServerBody,
}

impl ServerMessage {
    fn new(session_id: impl Into<String>, body: ServerBody) -> Self {
        ServerMessage {
            session_id: session_id.into(),
            timestamp: OffsetDateTime::now_utc(),
            body,
        }
    }

    pub fn parse_result(session_id: impl Into<String>, result: Arc<ParseResult>) -> Self {
        Self::new(session_id, ServerBody::ParseResult(result))
    }

    /// A parse that failed for reasons outside the grammar and text.
    pub fn parse_error(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            session_id,
            ServerBody::ParseError {
                error: error.into(),
                error_type: "parsing_error".to_string(),
            },
        )
    }

    pub fn session_info(info: SessionInfo) -> Self {
        Self::new(info.session_id.clone(), ServerBody::SessionInfo(info))
    }

    pub fn error(session_id: impl Into<String>, inbound: &InboundError) -> Self {
        let body = match inbound {
            InboundError::InvalidJson => ServerBody::Error {
                error: "Invalid JSON format".to_string(),
                details: None,
            },
            InboundError::InvalidFormat(details) => ServerBody::Error {
                error: "Invalid message format".to_string(),
                details: Some(details.clone()),
            },
        };
        Self::new(session_id, body)
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            ServerBody::ParseResult(_) => "parse_result",
            ServerBody::ParseError { .. } => "parse_error",
            ServerBody::SessionInfo(_) => "session_info",
            ServerBody::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, kind = self.kind(), "failed to serialize server message");
            format!(
                r#"{{"type":"error","session_id":{},"data":{{"error":"Internal error"}}}}"#,
                serde_json::Value::String(self.session_id.clone())
            )
        })
    }
}
