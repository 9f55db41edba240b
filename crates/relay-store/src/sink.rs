//! SQLite-backed [`PersistenceSink`].

use async_trait::async_trait;
use tracing::{debug, warn};

use relay_core::ids::SessionId;
use relay_core::persistence::{MessageType, PersistenceSink};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::screenshots::ScreenshotRepo;
use crate::sessions::SessionRepo;

/// Writes transcripts to the local database. Failures are logged and swallowed.
#[derive(Clone)]
pub struct SqliteSink {
    db: Database,
}

impl SqliteSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        match tokio::task::spawn_blocking(move || f(db)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(incident = "persistence_failure", op, error = %e, "persistence write failed");
                None
            }
            Err(e) => {
                warn!(incident = "persistence_failure", op, error = %e, "persistence task panicked");
                None
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn create_session(&self, url: &str) -> Option<SessionId> {
        let url = url.to_owned();
        let row = self
            .run("create_session", move |db| SessionRepo::new(db).create(&url))
            .await?;
        debug!(session_id = %row.id, "persisted session created");
        Some(row.id)
    }

    async fn end_session(&self, session_id: &SessionId) {
        let id = session_id.clone();
        let _ = self
            .run("end_session", move |db| SessionRepo::new(db).end(&id))
            .await;
    }

    async fn save_message(&self, session_id: &SessionId, kind: MessageType, content: &str) {
        let id = session_id.clone();
        let content = content.to_owned();
        let _ = self
            .run("save_message", move |db| {
                MessageRepo::new(db).append(&id, kind, &content).map(|_| ())
            })
            .await;
    }

    async fn save_screenshot(&self, session_id: &SessionId, data: &str) {
        let id = session_id.clone();
        let data = data.to_owned();
        let _ = self
            .run("save_screenshot", move |db| {
                ScreenshotRepo::new(db).append(&id, &data).map(|_| ())
            })
            .await;
    }
}
