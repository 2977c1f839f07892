use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::git::GitState;
use tether_core::ids::ConversationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A marker in a conversation's stream where the associated code state
/// changed. The sequence is ordered and non-decreasing in message_index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRecord {
    pub conversation_id: ConversationId,
    pub message_index: u64,
    pub git_state: GitState,
    pub recorded_at: String,
}

pub struct BoundaryRepo {
    db: Database,
}

impl BoundaryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a boundary. The message_index may not go backwards relative
    /// to the latest recorded boundary.
    #[instrument(skip(self, git_state), fields(conversation_id = %conversation_id, message_index))]
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        message_index: u64,
        git_state: &GitState,
    ) -> Result<BoundaryRecord, StoreError> {
        self.db.with_conn(|conn| {
            let latest_index: Option<i64> = conn
                .query_row(
                    "SELECT message_index FROM boundaries WHERE conversation_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    [conversation_id.as_str()],
                    |row| row.get(0),
                )
                .ok();

            if let Some(latest) = latest_index {
                if (message_index as i64) < latest {
                    return Err(StoreError::Conflict(format!(
                        "boundary index regression for {conversation_id}: {message_index} < {latest}"
                    )));
                }
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO boundaries (conversation_id, message_index, git_commit, git_branch, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    conversation_id.as_str(),
                    message_index as i64,
                    git_state.commit,
                    git_state.branch,
                    now,
                ],
            )?;

            Ok(BoundaryRecord {
                conversation_id: conversation_id.clone(),
                message_index,
                git_state: git_state.clone(),
                recorded_at: now,
            })
        })
    }

    /// All boundaries for a conversation, in recording order.
    pub fn list(&self, conversation_id: &ConversationId) -> Result<Vec<BoundaryRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, message_index, git_commit, git_branch, recorded_at
                 FROM boundaries WHERE conversation_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_boundary(row)?);
            }
            Ok(results)
        })
    }

    /// The most recently recorded boundary, if any.
    pub fn latest(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<BoundaryRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, message_index, git_commit, git_branch, recorded_at
                 FROM boundaries WHERE conversation_id = ?1 ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_boundary(row)?)),
                None => Ok(None),
            }
        })
    }

    /// The boundary governing a message index: the latest one recorded at
    /// or before that index.
    pub fn for_index(
        &self,
        conversation_id: &ConversationId,
        message_index: u64,
    ) -> Result<Option<BoundaryRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, message_index, git_commit, git_branch, recorded_at
                 FROM boundaries WHERE conversation_id = ?1 AND message_index <= ?2
                 ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                conversation_id.as_str(),
                message_index as i64
            ])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_boundary(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_boundary(row: &rusqlite::Row<'_>) -> Result<BoundaryRecord, StoreError> {
    Ok(BoundaryRecord {
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "boundaries",
            "conversation_id",
        )?),
        message_index: row_helpers::get::<i64>(row, 1, "boundaries", "message_index")? as u64,
        git_state: GitState {
            commit: row_helpers::get(row, 2, "boundaries", "git_commit")?,
            branch: row_helpers::get(row, 3, "boundaries", "git_branch")?,
        },
        recorded_at: row_helpers::get(row, 4, "boundaries", "recorded_at")?,
    })
}
