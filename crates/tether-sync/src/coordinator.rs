//! Sync coordinator: the engine behind upload, download, save and resume.
//!
//! Every operation on a conversation runs under that conversation's
//! exclusive lock, so concurrent callers serialize per conversation and
//! proceed in parallel across conversations. Local `SyncMetadata` is only
//! committed after the remote acknowledged a full payload; a cancelled or
//! failed network operation leaves local state exactly as it was.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_cloud::{BlobStore, Encryptor};
use tether_core::errors::{GitStateError, SessionError, SyncError};
use tether_core::events::{SyncEvent, SyncKind};
use tether_core::git::{GitSafetyCheck, GitState};
use tether_core::ids::{ConversationId, DeviceId, SessionId};
use tether_core::message::Message;
use tether_core::sync::{CompressionStats, SyncMetadata};
use tether_git::{GitBackend, GitError, GitStateVerifier, VerifierConfig};
use tether_store::boundaries::BoundaryRecord;
use tether_store::conversations::ConversationRepo;
use tether_store::messages::MessageRepo;
use tether_store::sessions::{SessionRepo, SessionRow};
use tether_store::sync_state::SyncStateRepo;
use tether_store::{Database, StoreError};
use tether_telemetry::MetricsRecorder;

use crate::codec::{self, SyncPlan};
use crate::error::EngineError;
use crate::linker::SessionLinker;
use crate::retry::{Retry, RetryConfig};

/// Messages allowed past the last snapshot before the next upload is
/// forced back to a full snapshot.
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1000;
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Tuning knobs for the coordinator.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub snapshot_threshold: u64,
    /// zstd level for payload compression.
    pub compression_level: i32,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            retry: RetryConfig::default(),
        }
    }
}

/// Caller's standing decision for git warnings. Without an explicit
/// opt-in, dirty or divergent working trees abort save/resume.
#[derive(Clone, Copy, Debug, Default)]
pub struct WarningResolution {
    pub proceed: bool,
}

impl WarningResolution {
    pub fn proceed() -> Self {
        Self { proceed: true }
    }
}

#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub kind: SyncKind,
    /// Messages carried by the uploaded payload. Zero for a no-op.
    pub message_count: u64,
    pub stats: Option<CompressionStats>,
    pub metadata: SyncMetadata,
}

#[derive(Clone, Debug)]
pub struct DownloadOutcome {
    /// Local stream length after the merge.
    pub merged_len: u64,
    /// Messages appended by this download.
    pub appended: u64,
    pub metadata: SyncMetadata,
}

#[derive(Clone, Debug)]
pub struct SaveOutcome {
    pub check: GitSafetyCheck,
    pub upload: UploadOutcome,
    pub session: SessionRow,
    /// Present only when the commit or branch moved since the last boundary.
    pub boundary: Option<BoundaryRecord>,
}

#[derive(Clone, Debug)]
pub struct ResumeOutcome {
    pub check: GitSafetyCheck,
    pub session: SessionRow,
    pub download: DownloadOutcome,
}

/// Orchestrates conversation sync against the blob store, gated by git
/// state for save/resume.
pub struct SyncCoordinator {
    blob_store: Arc<dyn BlobStore>,
    encryptor: Arc<dyn Encryptor>,
    git: Arc<dyn GitBackend>,
    verifier: GitStateVerifier,
    linker: SessionLinker,
    conversations: ConversationRepo,
    messages: MessageRepo,
    sync_state: SyncStateRepo,
    sessions: SessionRepo,
    retry: Retry,
    locks: DashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>,
    event_tx: broadcast::Sender<SyncEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
    config: SyncConfig,
}

impl SyncCoordinator {
    pub fn new(
        db: Database,
        blob_store: Arc<dyn BlobStore>,
        encryptor: Arc<dyn Encryptor>,
        git: Arc<dyn GitBackend>,
        event_tx: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self::with_config(db, blob_store, encryptor, git, event_tx, SyncConfig::default())
    }

    pub fn with_config(
        db: Database,
        blob_store: Arc<dyn BlobStore>,
        encryptor: Arc<dyn Encryptor>,
        git: Arc<dyn GitBackend>,
        event_tx: broadcast::Sender<SyncEvent>,
        config: SyncConfig,
    ) -> Self {
        Self {
            blob_store,
            encryptor,
            verifier: GitStateVerifier::new(git.clone()),
            git,
            linker: SessionLinker::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            sync_state: SyncStateRepo::new(db.clone()),
            sessions: SessionRepo::new(db),
            retry: Retry::new(config.retry.clone()),
            locks: DashMap::new(),
            event_tx,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_verifier_config(mut self, config: VerifierConfig) -> Self {
        self.verifier = GitStateVerifier::with_config(self.git.clone(), config);
        self
    }

    /// Serializes operations per conversation. Distinct conversations get
    /// distinct locks and run concurrently.
    fn conversation_lock(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn send_event(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.send(event) {
            warn!(error = %e, "no event receivers - event dropped");
        }
    }

    fn counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(name, labels, n);
        }
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.histogram_observe(name, labels, value);
        }
    }

    fn require_conversation(&self, conversation_id: &ConversationId) -> Result<(), EngineError> {
        match self.conversations.get(conversation_id) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(EngineError::Session(
                SessionError::ConversationNotFound(conversation_id.clone()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Upload unsynced messages. Plans snapshot vs delta from the local
    /// stream length, escalates a rejected delta to a full snapshot once,
    /// and commits `SyncMetadata` only after the remote acknowledged.
    #[instrument(skip(self, cancel), fields(conversation_id = %conversation_id))]
    pub async fn upload(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, EngineError> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;
        self.upload_locked(conversation_id, cancel).await
    }

    async fn upload_locked(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, EngineError> {
        self.require_conversation(conversation_id)?;

        // 1. Plan the payload from local state
        let total = self.messages.length(conversation_id)?;
        let metadata = self.sync_state.get(conversation_id)?;
        let plan = codec::decide(total, &metadata, self.config.snapshot_threshold);

        if plan == SyncPlan::NoOp {
            debug!(total, "nothing to sync");
            return Ok(UploadOutcome {
                kind: SyncKind::Noop,
                message_count: 0,
                stats: None,
                metadata,
            });
        }

        self.send_event(SyncEvent::UploadStarted {
            conversation_id: conversation_id.clone(),
        });
        let retries_before = self.retry.total_retries();

        // 2. Run the planned upload; a rejected delta base escalates to a
        //    full snapshot exactly once
        let result = if let SyncPlan::Delta { base_index } = plan {
            match self.push_delta(conversation_id, base_index, total, cancel).await {
                Err(EngineError::Sync(SyncError::ConflictBaseMismatch { expected_base })) => {
                    warn!(
                        base_index,
                        expected_base, "delta base rejected, escalating to full snapshot"
                    );
                    self.send_event(SyncEvent::ConflictDetected {
                        conversation_id: conversation_id.clone(),
                        expected_base,
                    });
                    self.send_event(SyncEvent::FallbackToSnapshot {
                        conversation_id: conversation_id.clone(),
                    });
                    self.counter("tether.sync.fallbacks", &[("op", "upload")], 1);
                    self.push_snapshot(conversation_id, total, cancel).await
                }
                other => other,
            }
        } else {
            self.push_snapshot(conversation_id, total, cancel).await
        };

        // 3. Report
        let retries = self.retry.total_retries() - retries_before;
        if retries > 0 {
            self.counter("tether.sync.retry_attempts", &[], retries);
        }

        match &result {
            Ok(outcome) => {
                self.counter("tether.sync.uploads", &[("kind", outcome.kind.as_str())], 1);
                if let Some(stats) = outcome.stats {
                    self.histogram("tether.sync.compression_ratio", &[], stats.ratio);
                    self.histogram(
                        "tether.sync.payload_bytes",
                        &[],
                        stats.compressed_size as f64,
                    );
                    self.send_event(SyncEvent::UploadCompleted {
                        conversation_id: conversation_id.clone(),
                        kind: outcome.kind,
                        message_count: outcome.message_count,
                        stats,
                    });
                }
            }
            Err(e) => {
                self.send_event(SyncEvent::SyncFailed {
                    conversation_id: conversation_id.clone(),
                    kind: e.kind().to_string(),
                });
            }
        }
        result
    }

    /// Compress, encrypt and upload the full stream, then commit.
    async fn push_snapshot(
        &self,
        conversation_id: &ConversationId,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, EngineError> {
        let messages = self.messages.range(conversation_id, 0, total)?;
        let (blob, stats) = codec::encode_messages(&messages, self.config.compression_level)?;
        let payload = self.encryptor.encrypt(&blob)?;

        let snapshot_id = self
            .retry
            .run(cancel, "upload_snapshot", || {
                self.blob_store
                    .upload_snapshot(conversation_id, payload.clone(), total)
            })
            .await?;

        // Commit point: the remote holds the full payload
        let metadata = self
            .sync_state
            .commit_upload(conversation_id, total, true, Utc::now())?;
        info!(snapshot_id = %snapshot_id, messages = total, ratio = stats.ratio, "snapshot uploaded");

        Ok(UploadOutcome {
            kind: SyncKind::Snapshot,
            message_count: total,
            stats: Some(stats),
            metadata,
        })
    }

    /// Upload only the messages past the last synced index.
    async fn push_delta(
        &self,
        conversation_id: &ConversationId,
        base_index: u64,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, EngineError> {
        let count = total - base_index;
        let messages = self.messages.range(conversation_id, base_index, total)?;
        let (blob, stats) = codec::encode_messages(&messages, self.config.compression_level)?;
        let payload = self.encryptor.encrypt(&blob)?;

        let delta_id = self
            .retry
            .run(cancel, "upload_delta", || {
                self.blob_store
                    .upload_delta(conversation_id, base_index, payload.clone(), count)
            })
            .await?;

        let metadata = self
            .sync_state
            .commit_upload(conversation_id, total, false, Utc::now())?;
        info!(delta_id = %delta_id, base_index, messages = count, "delta uploaded");

        Ok(UploadOutcome {
            kind: SyncKind::Delta,
            message_count: count,
            stats: Some(stats),
            metadata,
        })
    }

    /// Merge remote messages into the local stream. The merge is assembled
    /// in memory and persisted only once the delta chain checks out; a
    /// broken chain triggers one full-snapshot refetch before giving up.
    #[instrument(skip(self, cancel), fields(conversation_id = %conversation_id))]
    pub async fn download(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, EngineError> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;
        self.download_locked(conversation_id, cancel).await
    }

    async fn download_locked(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, EngineError> {
        self.send_event(SyncEvent::DownloadStarted {
            conversation_id: conversation_id.clone(),
        });
        let retries_before = self.retry.total_retries();

        let result = self.merge_remote(conversation_id, cancel).await;

        let retries = self.retry.total_retries() - retries_before;
        if retries > 0 {
            self.counter("tether.sync.retry_attempts", &[], retries);
        }

        match &result {
            Ok(outcome) => {
                self.counter("tether.sync.downloads", &[], 1);
                self.send_event(SyncEvent::DownloadCompleted {
                    conversation_id: conversation_id.clone(),
                    merged_len: outcome.merged_len,
                });
            }
            Err(e) => {
                self.send_event(SyncEvent::SyncFailed {
                    conversation_id: conversation_id.clone(),
                    kind: e.kind().to_string(),
                });
            }
        }
        result
    }

    async fn merge_remote(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, EngineError> {
        // 1. Cloud metadata, fetched fresh every time
        let cloud = self
            .retry
            .run(cancel, "get_metadata", || {
                self.blob_store.get_metadata(conversation_id)
            })
            .await?;

        let metadata = self.sync_state.get(conversation_id)?;
        let local_len = self.messages.length(conversation_id)?;

        if cloud.total_messages == 0 || cloud.total_messages <= local_len {
            debug!(
                local_len,
                cloud_total = cloud.total_messages,
                "nothing to download"
            );
            return Ok(DownloadOutcome {
                merged_len: local_len,
                appended: 0,
                metadata,
            });
        }

        // The conversation may not exist locally yet (first download on
        // this device)
        self.conversations.ensure(conversation_id)?;

        // 2. Assemble the merged stream in memory
        let merged = match self
            .assemble_remote(conversation_id, local_len, &metadata, cloud.total_messages, cancel)
            .await
        {
            Ok(merged) => merged,
            Err(EngineError::Sync(SyncError::SyncInconsistency {
                expected_base,
                found_base,
            })) => {
                // One full-snapshot refetch; a second inconsistency is fatal
                warn!(
                    expected_base,
                    found_base, "delta chain broken, refetching full snapshot"
                );
                self.send_event(SyncEvent::FallbackToSnapshot {
                    conversation_id: conversation_id.clone(),
                });
                self.counter("tether.sync.fallbacks", &[("op", "download")], 1);
                self.assemble_from_snapshot(conversation_id, cloud.total_messages, cancel)
                    .await?
            }
            Err(e) => return Err(e),
        };

        // 3. Persist only the suffix past what is already on disk
        let merged_len = merged.len() as u64;
        let appended = merged_len.saturating_sub(local_len);
        if appended > 0 {
            let suffix = &merged[local_len as usize..];
            self.messages.append_all(conversation_id, suffix)?;
        }

        // 4. Commit the merged position
        let metadata = self.sync_state.commit_download(
            conversation_id,
            merged_len,
            cloud.latest_snapshot_index,
            Utc::now(),
        )?;
        info!(merged_len, appended, "download merged");

        Ok(DownloadOutcome {
            merged_len,
            appended,
            metadata,
        })
    }

    /// Local prefix plus remote deltas. Falls back to the full snapshot
    /// path when this device has nothing yet.
    async fn assemble_remote(
        &self,
        conversation_id: &ConversationId,
        local_len: u64,
        metadata: &SyncMetadata,
        expected_total: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, EngineError> {
        if metadata.is_empty() || local_len == 0 {
            return self
                .assemble_from_snapshot(conversation_id, expected_total, cancel)
                .await;
        }

        let mut merged = self.messages.range(conversation_id, 0, local_len)?;
        let deltas = self
            .retry
            .run(cancel, "list_deltas", || {
                self.blob_store
                    .list_deltas(conversation_id, metadata.last_synced_message_index)
            })
            .await?;
        self.apply_deltas(conversation_id, &mut merged, &deltas, cancel)
            .await?;

        verify_merged_total(&merged, expected_total)?;
        Ok(merged)
    }

    /// Full remote stream: latest snapshot plus every delta above it.
    async fn assemble_from_snapshot(
        &self,
        conversation_id: &ConversationId,
        expected_total: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, EngineError> {
        let (payload, count) = self
            .retry
            .run(cancel, "fetch_snapshot", || {
                self.blob_store.fetch_snapshot(conversation_id)
            })
            .await?;
        let blob = self.encryptor.decrypt(&payload)?;
        let mut merged = codec::decode_messages(&blob)?;
        if merged.len() as u64 != count {
            return Err(SyncError::SyncInconsistency {
                expected_base: count,
                found_base: merged.len() as u64,
            }
            .into());
        }

        let deltas = self
            .retry
            .run(cancel, "list_deltas", || {
                self.blob_store.list_deltas(conversation_id, count)
            })
            .await?;
        self.apply_deltas(conversation_id, &mut merged, &deltas, cancel)
            .await?;

        verify_merged_total(&merged, expected_total)?;
        Ok(merged)
    }

    /// Each delta must continue exactly where the merged stream ends.
    async fn apply_deltas(
        &self,
        conversation_id: &ConversationId,
        merged: &mut Vec<Message>,
        deltas: &[tether_cloud::DeltaRef],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for delta in deltas {
            let merged_len = merged.len() as u64;
            if delta.base_index != merged_len {
                return Err(SyncError::SyncInconsistency {
                    expected_base: merged_len,
                    found_base: delta.base_index,
                }
                .into());
            }

            let payload = self
                .retry
                .run(cancel, "fetch_delta", || {
                    self.blob_store.fetch_delta(conversation_id, delta)
                })
                .await?;
            let blob = self.encryptor.decrypt(&payload)?;
            let mut messages = codec::decode_messages(&blob)?;
            if messages.len() as u64 != delta.message_count {
                return Err(SyncError::SyncInconsistency {
                    expected_base: delta.base_index + delta.message_count,
                    found_base: delta.base_index + messages.len() as u64,
                }
                .into());
            }
            merged.append(&mut messages);
        }
        Ok(())
    }

    /// Gated save: verify git state, upload, record the session, link the
    /// boundary when the commit or branch moved.
    #[instrument(skip(self, cancel, resolution), fields(conversation_id = %conversation_id, device_id = %device_id))]
    pub async fn save(
        &self,
        conversation_id: &ConversationId,
        device_id: &DeviceId,
        working_directory: &str,
        resolution: WarningResolution,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome, EngineError> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        // 1. Safety check, recomputed fresh
        let check = self.run_safety_check("save").await?;
        gate(&check, resolution)?;

        // 2. Upload before recording anything about the session
        let upload = self.upload_locked(conversation_id, cancel).await?;

        // 3. Session row at the current git state
        let git_state = self.current_git_state().await?;
        let repository_url = self.git.remote_url().await?.unwrap_or_default();
        let session = self.sessions.create(
            conversation_id,
            device_id,
            &git_state,
            &repository_url,
            working_directory,
        )?;

        // 4. Boundary only when the commit or branch moved
        let total = self.messages.length(conversation_id)?;
        let boundary = self
            .linker
            .record_boundary(conversation_id, total, &git_state)?;

        info!(session_id = %session.id, kind = upload.kind.as_str(), "session saved");
        Ok(SaveOutcome {
            check,
            upload,
            session,
            boundary,
        })
    }

    /// Gated resume: verify git state, move the working tree to the
    /// session's commit, confirm it landed there, then download.
    #[instrument(skip(self, cancel, resolution), fields(session_id = %session_id))]
    pub async fn resume(
        &self,
        session_id: &SessionId,
        resolution: WarningResolution,
        cancel: &CancellationToken,
    ) -> Result<ResumeOutcome, EngineError> {
        let session = match self.sessions.get(session_id) {
            Ok(session) => session,
            Err(StoreError::NotFound(_)) => {
                return Err(EngineError::Session(SessionError::SessionNotFound(
                    session_id.clone(),
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let lock = self.conversation_lock(&session.conversation_id);
        let _guard = lock.lock().await;

        // 1. Safety check before touching the working tree
        let check = self.run_safety_check("resume").await?;
        gate(&check, resolution)?;

        // 2. Move to the session's commit
        self.git.fetch().await?;
        match self.git.checkout(&session.git_commit).await {
            Ok(()) => {}
            Err(GitError::NotFound(reference)) => {
                return Err(EngineError::GitState(GitStateError::CommitNotFound {
                    reference,
                }))
            }
            Err(e) => return Err(e.into()),
        }

        // 3. The tree must actually be at the recorded commit
        self.linker
            .verify_resume_target(self.git.as_ref(), &session)
            .await?;

        // 4. Pull down whatever other devices uploaded
        let download = self
            .download_locked(&session.conversation_id, cancel)
            .await?;

        info!(
            conversation_id = %session.conversation_id,
            merged_len = download.merged_len,
            "session resumed"
        );
        Ok(ResumeOutcome {
            check,
            session,
            download,
        })
    }

    async fn run_safety_check(&self, op: &str) -> Result<GitSafetyCheck, EngineError> {
        let started = Instant::now();
        let check = self.verifier.check().await?;
        self.histogram(
            "tether.git.check_duration_ms",
            &[("op", op)],
            started.elapsed().as_millis() as f64,
        );
        debug!(op, outcome = check.outcome(), "safety check complete");
        Ok(check)
    }

    async fn current_git_state(&self) -> Result<GitState, EngineError> {
        let commit = self.git.rev_parse("HEAD").await?;
        let branch = self
            .git
            .current_branch()
            .await?
            .unwrap_or_else(|| "HEAD".to_string());
        Ok(GitState { commit, branch })
    }
}

/// Errors abort; warnings abort unless the caller opted to proceed.
fn gate(check: &GitSafetyCheck, resolution: WarningResolution) -> Result<(), EngineError> {
    if let Some(error) = check.errors.first() {
        return Err(EngineError::GitState(error.clone()));
    }
    if check.needs_decision() && !resolution.proceed {
        return Err(EngineError::WarningsPending(check.warnings.clone()));
    }
    Ok(())
}

/// The merge may run ahead of the metadata read if an upload raced us,
/// but it must never come up short.
fn verify_merged_total(merged: &[Message], expected_total: u64) -> Result<(), EngineError> {
    let merged_len = merged.len() as u64;
    if merged_len < expected_total {
        return Err(SyncError::SyncInconsistency {
            expected_base: expected_total,
            found_base: merged_len,
        }
        .into());
    }
    Ok(())
}
