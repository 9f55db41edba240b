//! Best-effort transcript persistence capability.
//!
//! Every method is infallible from the caller's side: implementations log
//! their own failures. A disabled store is just [`DisabledSink`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Agent,
    System,
    Thought,
    Action,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
            Self::Thought => write!(f, "thought"),
            Self::Action => write!(f, "action"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            "thought" => Ok(Self::Thought),
            "action" => Ok(Self::Action),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Open a transcript for a session at `url`. `None` when disabled or on failure.
    async fn create_session(&self, url: &str) -> Option<SessionId>;

    async fn end_session(&self, session_id: &SessionId);

    async fn save_message(&self, session_id: &SessionId, kind: MessageType, content: &str);

    async fn save_screenshot(&self, session_id: &SessionId, data: &str);
}

/// Sink used when persistence is turned off.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledSink;

#[async_trait]
impl PersistenceSink for DisabledSink {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_session(&self, _url: &str) -> Option<SessionId> {
        None
    }

    async fn end_session(&self, _session_id: &SessionId) {}

    async fn save_message(&self, _session_id: &SessionId, _kind: MessageType, _content: &str) {}

    async fn save_screenshot(&self, _session_id: &SessionId, _data: &str) {}
}
