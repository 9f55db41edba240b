use serde::Serialize;

use relay_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{MessageRepo, MessageRow};
use crate::screenshots::{ScreenshotRepo, ScreenshotRow};
use crate::sessions::{SessionRepo, SessionRow};

/// A session with its full transcript, as served by the history API.
#[derive(Clone, Debug, Serialize)]
pub struct SessionHistory {
    pub session: SessionRow,
    pub messages: Vec<MessageRow>,
    pub screenshots: Vec<ScreenshotRow>,
}

/// Read-side queries over the transcript database.
#[derive(Clone)]
pub struct HistoryReader {
    db: Database,
}

impl HistoryReader {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list_sessions(&self, limit: u32) -> Result<Vec<SessionRow>, StoreError> {
        SessionRepo::new(self.db.clone()).list(limit)
    }

    /// `NotFound` if the session does not exist.
    pub fn session_history(&self, id: &SessionId) -> Result<SessionHistory, StoreError> {
        let session = SessionRepo::new(self.db.clone()).get(id)?;
        let messages = MessageRepo::new(self.db.clone()).list_for_session(id)?;
        let screenshots = ScreenshotRepo::new(self.db.clone()).list_for_session(id)?;
        Ok(SessionHistory {
            session,
            messages,
            screenshots,
        })
    }
}
