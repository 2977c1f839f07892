use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local per-conversation sync bookkeeping. Mutated only by the sync
/// coordinator, and only after full remote acknowledgement.
///
/// `last_synced_message_index` is monotonically non-decreasing for the
/// lifetime of the conversation. `last_snapshot_index == 0` doubles as
/// "no snapshot uploaded yet".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub last_synced_message_index: u64,
    pub last_snapshot_index: u64,
    pub last_synced_timestamp: Option<DateTime<Utc>>,
    pub total_messages: u64,
}

impl SyncMetadata {
    /// True when this conversation has never completed a sync.
    pub fn is_empty(&self) -> bool {
        self.last_synced_message_index == 0
            && self.last_snapshot_index == 0
            && self.last_synced_timestamp.is_none()
    }
}

/// Size accounting for one compressed payload, reported on every
/// snapshot/delta build.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_size: u64,
    pub compressed_size: u64,
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new(original_size: u64, compressed_size: u64) -> Self {
        let ratio = if compressed_size == 0 {
            0.0
        } else {
            original_size as f64 / compressed_size as f64
        };
        Self {
            original_size,
            compressed_size,
            ratio,
        }
    }
}
