use tether_core::errors::SyncError;
use tether_core::events::SyncKind;
use tether_core::message::Message;
use tether_core::sync::{CompressionStats, SyncMetadata};

/// Payload shape for the next upload, derived from the local stream length
/// and sync bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPlan {
    /// Full stream `[0, total)`.
    Snapshot,
    /// Unsynced suffix `[base_index, total)`.
    Delta { base_index: u64 },
    /// Nothing new. The coordinator skips network I/O entirely.
    NoOp,
}

impl SyncPlan {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::Snapshot => SyncKind::Snapshot,
            Self::Delta { .. } => SyncKind::Delta,
            Self::NoOp => SyncKind::Noop,
        }
    }
}

/// Choose between a full snapshot and a delta for the next upload.
///
/// A snapshot is taken when the stream has never been snapshotted, or when
/// more than `snapshot_threshold` messages have accumulated since the last
/// one. Otherwise only the unsynced suffix is sent.
pub fn decide(total: u64, metadata: &SyncMetadata, snapshot_threshold: u64) -> SyncPlan {
    if total <= metadata.last_synced_message_index {
        return SyncPlan::NoOp;
    }
    if metadata.last_snapshot_index == 0
        || total - metadata.last_snapshot_index > snapshot_threshold
    {
        return SyncPlan::Snapshot;
    }
    SyncPlan::Delta {
        base_index: metadata.last_synced_message_index,
    }
}

/// Serialize messages as a JSON array and compress with zstd.
pub fn encode_messages(
    messages: &[Message],
    level: i32,
) -> Result<(Vec<u8>, CompressionStats), SyncError> {
    let json = serde_json::to_vec(messages)
        .map_err(|e| SyncError::CompressionFailure(format!("serialize: {e}")))?;
    let compressed = zstd::encode_all(json.as_slice(), level)
        .map_err(|e| SyncError::CompressionFailure(format!("compress: {e}")))?;
    let stats = CompressionStats::new(json.len() as u64, compressed.len() as u64);
    Ok((compressed, stats))
}

/// Decompress and deserialize a payload produced by [`encode_messages`].
pub fn decode_messages(blob: &[u8]) -> Result<Vec<Message>, SyncError> {
    let json = zstd::decode_all(blob)
        .map_err(|e| SyncError::CompressionFailure(format!("decompress: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| SyncError::CompressionFailure(format!("deserialize: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::message::GitContext;

    const THRESHOLD: u64 = 1000;

    fn meta(synced: u64, snapshot: u64) -> SyncMetadata {
        SyncMetadata {
            last_synced_message_index: synced,
            last_snapshot_index: snapshot,
            last_synced_timestamp: None,
            total_messages: synced,
        }
    }

    #[test]
    fn fresh_stream_gets_snapshot() {
        let plan = decide(800, &SyncMetadata::default(), THRESHOLD);
        assert_eq!(plan, SyncPlan::Snapshot);
    }

    #[test]
    fn small_suffix_gets_delta() {
        let plan = decide(850, &meta(800, 800), THRESHOLD);
        assert_eq!(plan, SyncPlan::Delta { base_index: 800 });
    }

    #[test]
    fn accumulation_past_threshold_forces_snapshot() {
        // 1850 - 800 = 1050 > 1000
        let plan = decide(1850, &meta(800, 800), THRESHOLD);
        assert_eq!(plan, SyncPlan::Snapshot);
    }

    #[test]
    fn exactly_at_threshold_still_delta() {
        // 1800 - 800 = 1000, not strictly greater
        let plan = decide(1800, &meta(850, 800), THRESHOLD);
        assert_eq!(plan, SyncPlan::Delta { base_index: 850 });
    }

    #[test]
    fn nothing_new_is_noop() {
        assert_eq!(decide(0, &SyncMetadata::default(), THRESHOLD), SyncPlan::NoOp);
        assert_eq!(decide(850, &meta(850, 800), THRESHOLD), SyncPlan::NoOp);
    }

    #[test]
    fn plan_kind_mapping() {
        assert_eq!(SyncPlan::Snapshot.kind(), SyncKind::Snapshot);
        assert_eq!(SyncPlan::Delta { base_index: 5 }.kind(), SyncKind::Delta);
        assert_eq!(SyncPlan::NoOp.kind(), SyncKind::Noop);
    }

    #[test]
    fn roundtrip_preserves_messages() {
        let messages = vec![
            Message::user("fix the race in the watcher").with_git_context(GitContext {
                commit: "abc123".into(),
                branch: "main".into(),
                repository: "git@example.com:me/project.git".into(),
                modified_files: vec!["src/watcher.rs".into()],
            }),
            Message::assistant("done, see the new test"),
        ];

        let (blob, stats) = encode_messages(&messages, 3).unwrap();
        assert!(stats.original_size > 0);
        assert_eq!(stats.compressed_size, blob.len() as u64);

        let decoded = decode_messages(&blob).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn repetitive_payload_compresses() {
        let messages: Vec<Message> = (0..200)
            .map(|i| Message::assistant(format!("processing step {i} of the same long plan")))
            .collect();

        let (blob, stats) = encode_messages(&messages, 3).unwrap();
        assert!((blob.len() as u64) < stats.original_size);
        assert!(stats.ratio > 1.0);
    }

    #[test]
    fn empty_message_list_roundtrips() {
        let (blob, _) = encode_messages(&[], 3).unwrap();
        let decoded = decode_messages(&blob).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn garbage_blob_rejected() {
        let result = decode_messages(b"not a zstd frame");
        assert!(matches!(result, Err(SyncError::CompressionFailure(_))));
    }

    #[test]
    fn valid_frame_wrong_shape_rejected() {
        // Well-formed zstd, but the JSON inside is not a message array
        let blob = zstd::encode_all(&br#"{"not":"messages"}"#[..], 3).unwrap();
        let result = decode_messages(&blob);
        assert!(matches!(result, Err(SyncError::CompressionFailure(_))));
    }
}
