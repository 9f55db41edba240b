//! Wire protocol between the relay and its chat client.
//!
//! Every message is one JSON object with a `type` discriminator. Encoding is
//! a one-event-to-one-message mapping; nothing is batched or reordered here.

use serde::{Deserialize, Serialize};

/// Session state as shown to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Error,
    Disconnected,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Error => write!(f, "error"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Server → client events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Thought {
        content: String,
    },
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Base64-encoded PNG of the current page.
    Screenshot {
        data: String,
    },
    Status {
        status: AgentStatus,
    },
    Nav {
        url: String,
    },
    Error {
        message: String,
    },
    TaskComplete {
        success: bool,
    },
}

impl ServerEvent {
    pub fn status(status: AgentStatus) -> Self {
        Self::Status { status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Action { .. } => "action",
            Self::Screenshot { .. } => "screenshot",
            Self::Status { .. } => "status",
            Self::Nav { .. } => "nav",
            Self::Error { .. } => "error",
            Self::TaskComplete { .. } => "taskComplete",
        }
    }
}

/// Client → server commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    Start { url: String },
    Task { content: String },
    Stop,
}

impl ClientCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Task { .. } => "task",
            Self::Stop => "stop",
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Command(ClientCommand),
    /// Well-formed JSON whose `type` is not a known command. Logged and ignored.
    Unknown(Option<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("failed to encode event: {0}")]
    Encode(String),
}

const KNOWN_COMMANDS: [&str; 3] = ["start", "task", "stop"];

/// Decode one text frame from the client.
///
/// Invalid JSON, or a known command type with missing/invalid fields, is
/// `Malformed`. Anything else without a recognised `type` is `Unknown`.
pub fn decode_command(raw: &str) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value.get("type").and_then(|t| t.as_str());
    match kind {
        Some(k) if KNOWN_COMMANDS.contains(&k) => serde_json::from_value(value)
            .map(Inbound::Command)
            .map_err(|e| ProtocolError::Malformed(e.to_string())),
        other => Ok(Inbound::Unknown(other.map(str::to_owned))),
    }
}

/// Encode one server event as a wire message.
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}
