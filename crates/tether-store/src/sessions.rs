use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::git::GitState;
use tether_core::ids::{ConversationId, DeviceId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A saved session: the link between a conversation and the code state it
/// was saved at. Immutable once stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    pub device_id: DeviceId,
    pub git_commit: String,
    pub branch: String,
    pub repository_url: String,
    pub working_directory: String,
    pub created_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a session at save time.
    #[instrument(skip(self, git_state), fields(conversation_id = %conversation_id, device_id = %device_id))]
    pub fn create(
        &self,
        conversation_id: &ConversationId,
        device_id: &DeviceId,
        git_state: &GitState,
        repository_url: &str,
        working_directory: &str,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, conversation_id, device_id, git_commit, branch, repository_url, working_directory, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    device_id.as_str(),
                    git_state.commit,
                    git_state.branch,
                    repository_url,
                    working_directory,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id: id.clone(),
                conversation_id: conversation_id.clone(),
                device_id: device_id.clone(),
                git_commit: git_state.commit.clone(),
                branch: git_state.branch.clone(),
                repository_url: repository_url.to_string(),
                working_directory: working_directory.to_string(),
                created_at: now.clone(),
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, device_id, git_commit, branch, repository_url, working_directory, created_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions for a conversation, newest first.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, device_id, git_commit, branch, repository_url, working_directory, created_at
                 FROM sessions WHERE conversation_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                conversation_id.as_str(),
                limit,
                offset
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Delete a session record. The conversation and its messages are
    /// left untouched.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "sessions",
            "conversation_id",
        )?),
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 2, "sessions", "device_id")?),
        git_commit: row_helpers::get(row, 3, "sessions", "git_commit")?,
        branch: row_helpers::get(row, 4, "sessions", "branch")?,
        repository_url: row_helpers::get(row, 5, "sessions", "repository_url")?,
        working_directory: row_helpers::get(row, 6, "sessions", "working_directory")?,
        created_at: row_helpers::get(row, 7, "sessions", "created_at")?,
    })
}
