use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::ids::ConversationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new conversation.
    #[instrument(skip(self))]
    pub fn create(&self, title: Option<&str>) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![id.as_str(), title, now],
            )?;

            Ok(ConversationRow {
                id: id.clone(),
                title: title.map(String::from),
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    /// Create the conversation row for a known ID if it does not exist yet.
    /// Used when a download materializes a conversation that originated on
    /// another device.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn ensure(&self, id: &ConversationId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, title, created_at, updated_at)
                 VALUES (?1, NULL, ?2, ?2)",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
    }

    /// Get a conversation by ID.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// List conversations, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM conversations
                 ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        title: row_helpers::get_opt(row, 1, "conversations", "title")?,
        created_at: row_helpers::get(row, 2, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 3, "conversations", "updated_at")?,
    })
}
