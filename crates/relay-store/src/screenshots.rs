use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{ScreenshotId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenshotRow {
    pub id: ScreenshotId,
    pub session_id: SessionId,
    /// Base64-encoded PNG, stored as sent to the client.
    pub data: String,
    pub created_at: String,
}

pub struct ScreenshotRepo {
    db: Database,
}

impl ScreenshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, data), fields(session_id = %session_id, bytes = data.len()))]
    pub fn append(&self, session_id: &SessionId, data: &str) -> Result<ScreenshotRow, StoreError> {
        let id = ScreenshotId::new();
        let now = row_helpers::now_timestamp();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO screenshots (id, session_id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), session_id.as_str(), data, now],
            )?;
            Ok(ScreenshotRow {
                id,
                session_id: session_id.clone(),
                data: data.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<ScreenshotRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, data, created_at FROM screenshots
                 WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(ScreenshotRow {
                    id: ScreenshotId::from_raw(row_helpers::get::<String>(row, 0, "screenshots", "id")?),
                    session_id: SessionId::from_raw(row_helpers::get::<String>(
                        row,
                        1,
                        "screenshots",
                        "session_id",
                    )?),
                    data: row_helpers::get(row, 2, "screenshots", "data")?,
                    created_at: row_helpers::get(row, 3, "screenshots", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    #[test]
    fn append_and_list() {
        let db = Database::in_memory().unwrap();
        let sid = SessionRepo::new(db.clone()).create("https://example.com").unwrap().id;
        let repo = ScreenshotRepo::new(db);

        repo.append(&sid, "AAAA").unwrap();
        repo.append(&sid, "BBBB").unwrap();

        let shots = repo.list_for_session(&sid).unwrap();
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].data, "AAAA");
        assert_eq!(shots[1].data, "BBBB");
        assert!(shots[0].id.as_str().starts_with("shot_"));
    }
}
