use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One persisted agent session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub url: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub ended_at: Option<String>,
}

const SELECT_SESSION: &str = "SELECT id, url, status, created_at, ended_at FROM sessions";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, url: &str) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = row_helpers::now_timestamp();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, url, status, created_at) VALUES (?1, ?2, 'active', ?3)",
                rusqlite::params![id.as_str(), url, now],
            )?;

            Ok(SessionRow {
                id,
                url: url.to_string(),
                status: SessionStatus::Active,
                created_at: now,
                ended_at: None,
            })
        })
    }

    /// Mark a session ended. Ending twice keeps the first end time.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn end(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = row_helpers::now_timestamp();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'ended', ended_at = COALESCE(ended_at, ?1) WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_SESSION} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SESSION} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 2, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        url: row_helpers::get(row, 1, "sessions", "url")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        created_at: row_helpers::get(row, 3, "sessions", "created_at")?,
        ended_at: row_helpers::get_opt(row, 4, "sessions", "ended_at")?,
    })
}
