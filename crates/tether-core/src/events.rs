use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;
use crate::sync::CompressionStats;

/// Payload shape chosen for one sync operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Snapshot,
    Delta,
    Noop,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Delta => "delta",
            Self::Noop => "noop",
        }
    }
}

/// Sync lifecycle events broadcast while the coordinator runs.
/// Observers (daemon logging, UI surfaces) subscribe; losing one is harmless.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    #[serde(rename = "upload_started")]
    UploadStarted { conversation_id: ConversationId },

    #[serde(rename = "upload_completed")]
    UploadCompleted {
        conversation_id: ConversationId,
        kind: SyncKind,
        message_count: u64,
        stats: CompressionStats,
    },

    #[serde(rename = "conflict_detected")]
    ConflictDetected {
        conversation_id: ConversationId,
        expected_base: u64,
    },

    #[serde(rename = "fallback_to_snapshot")]
    FallbackToSnapshot { conversation_id: ConversationId },

    #[serde(rename = "download_started")]
    DownloadStarted { conversation_id: ConversationId },

    #[serde(rename = "download_completed")]
    DownloadCompleted {
        conversation_id: ConversationId,
        merged_len: u64,
    },

    #[serde(rename = "sync_failed")]
    SyncFailed {
        conversation_id: ConversationId,
        kind: String,
    },
}

impl SyncEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::UploadStarted { conversation_id }
            | Self::UploadCompleted { conversation_id, .. }
            | Self::ConflictDetected { conversation_id, .. }
            | Self::FallbackToSnapshot { conversation_id }
            | Self::DownloadStarted { conversation_id }
            | Self::DownloadCompleted { conversation_id, .. }
            | Self::SyncFailed { conversation_id, .. } => conversation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UploadStarted { .. } => "upload_started",
            Self::UploadCompleted { .. } => "upload_completed",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::FallbackToSnapshot { .. } => "fallback_to_snapshot",
            Self::DownloadStarted { .. } => "download_started",
            Self::DownloadCompleted { .. } => "download_completed",
            Self::SyncFailed { .. } => "sync_failed",
        }
    }
}
