use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use tether_core::errors::SyncError;
use tether_core::ids::{ConversationId, DeltaId, SnapshotId};

use crate::store::{BlobStore, CloudMetadata, DeltaRef};

struct StoredSnapshot {
    blob: Vec<u8>,
    message_count: u64,
}

struct StoredDelta {
    id: DeltaId,
    base_index: u64,
    message_count: u64,
    blob: Vec<u8>,
}

#[derive(Default)]
struct ConversationBlobs {
    snapshot: Option<StoredSnapshot>,
    deltas: Vec<StoredDelta>,
    total_messages: u64,
}

/// In-memory blob store for deterministic testing without a server.
///
/// Enforces the same base-index discipline a real server would: a delta
/// whose `base_index` is not the current `total_messages` is rejected with
/// the expected base. Failures can be injected per operation name and are
/// consumed in FIFO order; every call is recorded so tests can assert how
/// much network traffic an operation produced.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<HashMap<ConversationId, ConversationBlobs>>,
    failures: Mutex<HashMap<String, VecDeque<SyncError>>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call to `op` ("upload_snapshot",
    /// "upload_delta", ...). Multiple queued errors fail successive calls.
    pub fn fail_next(&self, op: &str, error: SyncError) {
        self.failures
            .lock()
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == op).count()
    }

    /// Total calls across all operations.
    pub fn network_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Server-side message total, 0 for unknown conversations.
    pub fn total_messages(&self, conversation_id: &ConversationId) -> u64 {
        self.state
            .lock()
            .get(conversation_id)
            .map(|c| c.total_messages)
            .unwrap_or(0)
    }

    fn begin(&self, op: &str) -> Result<(), SyncError> {
        self.calls.lock().push(op.to_string());
        if let Some(queue) = self.failures.lock().get_mut(op) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload_snapshot(
        &self,
        conversation_id: &ConversationId,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<SnapshotId, SyncError> {
        self.begin("upload_snapshot")?;
        let mut state = self.state.lock();
        let conv = state.entry(conversation_id.clone()).or_default();
        conv.snapshot = Some(StoredSnapshot {
            blob,
            message_count,
        });
        // Deltas below the new snapshot's coverage are now redundant.
        conv.deltas.retain(|d| d.base_index >= message_count);
        conv.total_messages = conv.total_messages.max(message_count);
        Ok(SnapshotId::new())
    }

    async fn upload_delta(
        &self,
        conversation_id: &ConversationId,
        base_index: u64,
        blob: Vec<u8>,
        message_count: u64,
    ) -> Result<DeltaId, SyncError> {
        self.begin("upload_delta")?;
        let mut state = self.state.lock();
        let conv = state.entry(conversation_id.clone()).or_default();
        if base_index != conv.total_messages {
            return Err(SyncError::ConflictBaseMismatch {
                expected_base: conv.total_messages,
            });
        }
        let id = DeltaId::new();
        conv.deltas.push(StoredDelta {
            id: id.clone(),
            base_index,
            message_count,
            blob,
        });
        conv.total_messages = base_index + message_count;
        Ok(id)
    }

    async fn list_deltas(
        &self,
        conversation_id: &ConversationId,
        after_index: u64,
    ) -> Result<Vec<DeltaRef>, SyncError> {
        self.begin("list_deltas")?;
        let state = self.state.lock();
        let Some(conv) = state.get(conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(conv
            .deltas
            .iter()
            .filter(|d| d.base_index >= after_index)
            .map(|d| DeltaRef {
                id: d.id.clone(),
                base_index: d.base_index,
                message_count: d.message_count,
            })
            .collect())
    }

    async fn fetch_snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Vec<u8>, u64), SyncError> {
        self.begin("fetch_snapshot")?;
        let state = self.state.lock();
        state
            .get(conversation_id)
            .and_then(|c| c.snapshot.as_ref())
            .map(|s| (s.blob.clone(), s.message_count))
            .ok_or_else(|| SyncError::NotFound(format!("no snapshot for {conversation_id}")))
    }

    async fn fetch_delta(
        &self,
        conversation_id: &ConversationId,
        delta: &DeltaRef,
    ) -> Result<Vec<u8>, SyncError> {
        self.begin("fetch_delta")?;
        let state = self.state.lock();
        state
            .get(conversation_id)
            .and_then(|c| c.deltas.iter().find(|d| d.id == delta.id))
            .map(|d| d.blob.clone())
            .ok_or_else(|| SyncError::NotFound(format!("no delta {}", delta.id)))
    }

    async fn get_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<CloudMetadata, SyncError> {
        self.begin("get_metadata")?;
        let state = self.state.lock();
        let Some(conv) = state.get(conversation_id) else {
            return Ok(CloudMetadata::default());
        };
        Ok(CloudMetadata {
            total_messages: conv.total_messages,
            latest_snapshot_index: conv
                .snapshot
                .as_ref()
                .map(|s| s.message_count)
                .unwrap_or(0),
            // Compressed-vs-original ratio is client-side knowledge.
            compression_ratio: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new()
    }

    #[tokio::test]
    async fn snapshot_then_metadata() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![1, 2, 3], 800).await.unwrap();

        let meta = store.get_metadata(&id).await.unwrap();
        assert_eq!(meta.total_messages, 800);
        assert_eq!(meta.latest_snapshot_index, 800);
    }

    #[tokio::test]
    async fn delta_with_matching_base_accepted() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![1], 800).await.unwrap();
        store.upload_delta(&id, 800, vec![2], 50).await.unwrap();

        let meta = store.get_metadata(&id).await.unwrap();
        assert_eq!(meta.total_messages, 850);
        assert_eq!(meta.latest_snapshot_index, 800);
    }

    #[tokio::test]
    async fn stale_delta_rejected_with_expected_base() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![1], 800).await.unwrap();
        store.upload_delta(&id, 800, vec![2], 50).await.unwrap();

        // Another device already advanced the server to 850.
        let err = store.upload_delta(&id, 800, vec![3], 10).await.unwrap_err();
        match err {
            SyncError::ConflictBaseMismatch { expected_base } => assert_eq!(expected_base, 850),
            other => panic!("expected conflict, got: {other:?}"),
        }
        // Rejected delta must not advance the server.
        assert_eq!(store.total_messages(&id), 850);
    }

    #[tokio::test]
    async fn list_deltas_filters_and_orders() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![1], 100).await.unwrap();
        store.upload_delta(&id, 100, vec![2], 10).await.unwrap();
        store.upload_delta(&id, 110, vec![3], 10).await.unwrap();
        store.upload_delta(&id, 120, vec![4], 5).await.unwrap();

        let refs = store.list_deltas(&id, 110).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].base_index, 110);
        assert_eq!(refs[1].base_index, 120);
    }

    #[tokio::test]
    async fn new_snapshot_prunes_covered_deltas() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![1], 800).await.unwrap();
        store.upload_delta(&id, 800, vec![2], 50).await.unwrap();

        store.upload_snapshot(&id, vec![5], 1850).await.unwrap();

        let refs = store.list_deltas(&id, 0).await.unwrap();
        assert!(refs.is_empty(), "deltas below the snapshot should be gone");
        let meta = store.get_metadata(&id).await.unwrap();
        assert_eq!(meta.total_messages, 1850);
        assert_eq!(meta.latest_snapshot_index, 1850);
    }

    #[tokio::test]
    async fn fetch_roundtrip() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.upload_snapshot(&id, vec![9, 9, 9], 3).await.unwrap();
        store.upload_delta(&id, 3, vec![7, 7], 2).await.unwrap();

        let (blob, count) = store.fetch_snapshot(&id).await.unwrap();
        assert_eq!(blob, vec![9, 9, 9]);
        assert_eq!(count, 3);

        let refs = store.list_deltas(&id, 0).await.unwrap();
        let delta_blob = store.fetch_delta(&id, &refs[0]).await.unwrap();
        assert_eq!(delta_blob, vec![7, 7]);
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.fetch_snapshot(&conv()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_conversation_has_empty_metadata() {
        let store = MemoryBlobStore::new();
        let meta = store.get_metadata(&conv()).await.unwrap();
        assert_eq!(meta, CloudMetadata::default());
    }

    #[tokio::test]
    async fn injected_failures_consumed_in_order() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.fail_next("upload_snapshot", SyncError::NetworkTimeout("t1".into()));
        store.fail_next("upload_snapshot", SyncError::NetworkTimeout("t2".into()));

        assert!(store.upload_snapshot(&id, vec![1], 10).await.is_err());
        assert!(store.upload_snapshot(&id, vec![1], 10).await.is_err());
        assert!(store.upload_snapshot(&id, vec![1], 10).await.is_ok());
        assert_eq!(store.call_count("upload_snapshot"), 3);
    }

    #[tokio::test]
    async fn failed_calls_still_counted() {
        let store = MemoryBlobStore::new();
        let id = conv();
        store.fail_next("get_metadata", SyncError::NetworkError("down".into()));
        let _ = store.get_metadata(&id).await;
        assert_eq!(store.network_calls(), 1);
    }
}
