use chrono::{DateTime, Utc};
use tracing::instrument;

use tether_core::ids::ConversationId;
use tether_core::sync::SyncMetadata;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persistence for per-conversation sync bookkeeping.
/// Only the sync coordinator calls the mutating methods, and only at its
/// commit point after full remote acknowledgement.
pub struct SyncStateRepo {
    db: Database,
}

impl SyncStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current metadata, or the zeroed default if this conversation has
    /// never synced.
    pub fn get(&self, conversation_id: &ConversationId) -> Result<SyncMetadata, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT last_synced_message_index, last_snapshot_index, last_synced_timestamp, total_messages
                 FROM sync_state WHERE conversation_id = ?1",
            )?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_metadata(row),
                None => Ok(SyncMetadata::default()),
            }
        })
    }

    /// Record a completed upload: the stream is synced through `total`.
    /// `snapshot` additionally moves the snapshot watermark to `total`.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, total, snapshot))]
    pub fn commit_upload(
        &self,
        conversation_id: &ConversationId,
        total: u64,
        snapshot: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<SyncMetadata, StoreError> {
        self.commit(conversation_id, total, snapshot.then_some(total), timestamp)
    }

    /// Record a completed download merge. The snapshot watermark follows
    /// the cloud's latest snapshot index.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, merged_len, snapshot_index))]
    pub fn commit_download(
        &self,
        conversation_id: &ConversationId,
        merged_len: u64,
        snapshot_index: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<SyncMetadata, StoreError> {
        self.commit(conversation_id, merged_len, Some(snapshot_index), timestamp)
    }

    fn commit(
        &self,
        conversation_id: &ConversationId,
        synced_index: u64,
        snapshot_index: Option<u64>,
        timestamp: DateTime<Utc>,
    ) -> Result<SyncMetadata, StoreError> {
        self.db.with_conn(|conn| {
            let existing: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT last_synced_message_index, last_snapshot_index
                     FROM sync_state WHERE conversation_id = ?1",
                    [conversation_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();

            let (prev_synced, prev_snapshot) = existing.unwrap_or((0, 0));

            // last_synced_message_index never decreases
            if (synced_index as i64) < prev_synced {
                return Err(StoreError::Conflict(format!(
                    "sync index regression for {conversation_id}: {synced_index} < {prev_synced}"
                )));
            }

            let snapshot_index = snapshot_index
                .map(|s| s as i64)
                .unwrap_or(prev_snapshot);
            let ts = timestamp.to_rfc3339();

            conn.execute(
                "INSERT INTO sync_state
                    (conversation_id, last_synced_message_index, last_snapshot_index, last_synced_timestamp, total_messages)
                 VALUES (?1, ?2, ?3, ?4, ?2)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    last_synced_message_index = ?2,
                    last_snapshot_index = ?3,
                    last_synced_timestamp = ?4,
                    total_messages = ?2",
                rusqlite::params![
                    conversation_id.as_str(),
                    synced_index as i64,
                    snapshot_index,
                    ts,
                ],
            )?;

            Ok(SyncMetadata {
                last_synced_message_index: synced_index,
                last_snapshot_index: snapshot_index as u64,
                last_synced_timestamp: Some(timestamp),
                total_messages: synced_index,
            })
        })
    }
}

fn row_to_metadata(row: &rusqlite::Row<'_>) -> Result<SyncMetadata, StoreError> {
    let ts_raw: Option<String> =
        row_helpers::get_opt(row, 2, "sync_state", "last_synced_timestamp")?;
    let last_synced_timestamp = match ts_raw {
        Some(raw) => Some(row_helpers::parse_timestamp(
            &raw,
            "sync_state",
            "last_synced_timestamp",
        )?),
        None => None,
    };

    Ok(SyncMetadata {
        last_synced_message_index: row_helpers::get::<i64>(
            row,
            0,
            "sync_state",
            "last_synced_message_index",
        )? as u64,
        last_snapshot_index: row_helpers::get::<i64>(row, 1, "sync_state", "last_snapshot_index")?
            as u64,
        last_synced_timestamp,
        total_messages: row_helpers::get::<i64>(row, 3, "sync_state", "total_messages")? as u64,
    })
}
