use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::errors::SyncError;
use tether_core::ids::{ConversationId, DeltaId, SnapshotId};

/// Reference to one stored delta. Ordering by `base_index` is the order
/// deltas must be applied in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRef {
    pub id: DeltaId,
    pub base_index: u64,
    pub message_count: u64,
}

/// Server-side view of a conversation's sync state. Always fetched fresh,
/// never cached locally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMetadata {
    pub total_messages: u64,
    pub latest_snapshot_index: u64,
    pub compression_ratio: f64,
}

/// Remote storage for compressed conversation payloads.
///
/// Payloads are opaque bytes by the time they reach this boundary
/// (compressed, then encrypted). The store's only structural knowledge is
/// message counts and base indices, which it uses to reject stale deltas:
/// `upload_delta` with a `base_index` that does not equal the server's
/// current `total_messages` must fail with
/// `SyncError::ConflictBaseMismatch` carrying the expected base.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a full snapshot covering `[0, message_count)`. Replaces any
    /// previous snapshot for the conversation.
    async fn upload_snapshot(
        &self,
        conversation_id: &ConversationId,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<SnapshotId, SyncError>;

    /// Store a delta covering `[base_index, base_index + message_count)`.
    async fn upload_delta(
        &self,
        conversation_id: &ConversationId,
        base_index: u64,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<DeltaId, SyncError>;

    /// Deltas with `base_index >= after_index`, ascending by `base_index`.
    async fn list_deltas(
        &self,
        conversation_id: &ConversationId,
        after_index: u64,
    ) -> Result<Vec<DeltaRef>, SyncError>;

    /// Latest snapshot blob and the message count it covers.
    async fn fetch_snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Vec<u8>, u64), SyncError>;

    async fn fetch_delta(
        &self,
        conversation_id: &ConversationId,
        delta: &DeltaRef,
    ) -> Result<Vec<u8>, SyncError>;

    async fn get_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<CloudMetadata, SyncError>;
}
