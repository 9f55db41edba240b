use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{MessageId, SessionId};
use relay_core::persistence::MessageType;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One transcript line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(session_id = %session_id, kind = %kind))]
    pub fn append(
        &self,
        session_id: &SessionId,
        kind: MessageType,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = row_helpers::now_timestamp();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, type, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), kind.to_string(), content, now],
            )?;

            Ok(MessageRow {
                id,
                session_id: session_id.clone(),
                kind,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// All messages for a session in insertion order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, type, content, created_at FROM messages
                 WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let kind: String = row_helpers::get(row, 2, "messages", "type")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        kind: row_helpers::parse_enum(&kind, "messages", "type")?,
        content: row_helpers::get(row, 3, "messages", "content")?,
        created_at: row_helpers::get(row, 4, "messages", "created_at")?,
    })
}
