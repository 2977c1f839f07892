use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, SessionId};

/// Typed error hierarchy for sync protocol operations.
/// Classifies errors as fatal (don't retry), retryable, or conflicts that
/// trigger the one-shot snapshot fallback.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    // Conflicts — escalate once to a full snapshot, never blind-retry
    #[error("delta base mismatch, server expects base {expected_base}")]
    ConflictBaseMismatch { expected_base: u64 },
    #[error("delta out of order: expected base {expected_base}, found {found_base}")]
    SyncInconsistency { expected_base: u64, found_base: u64 },

    // Fatal — don't retry
    #[error("compression failed: {0}")]
    CompressionFailure(String),
    #[error("encryption failed: {0}")]
    EncryptionFailure(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout(_)
                | Self::NetworkError(_)
                | Self::ServerError { .. }
                | Self::RateLimited { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CompressionFailure(_)
                | Self::EncryptionFailure(_)
                | Self::AuthenticationFailed(_)
                | Self::NotFound(_)
                | Self::InvalidRequest(_)
        )
    }

    /// True for the rejections that escalate to a full snapshot exactly once.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConflictBaseMismatch { .. } | Self::SyncInconsistency { .. }
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConflictBaseMismatch { .. } => "conflict_base_mismatch",
            Self::SyncInconsistency { .. } => "sync_inconsistency",
            Self::CompressionFailure(_) => "compression_failure",
            Self::EncryptionFailure(_) => "encryption_failure",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NetworkTimeout(_) => "network_timeout",
            Self::NetworkError(_) => "network_error",
            Self::ServerError { .. } => "server_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            404 => Self::NotFound(body),
            400 => Self::InvalidRequest(body),
            409 => match parse_expected_base(&body) {
                Some(expected_base) => Self::ConflictBaseMismatch { expected_base },
                None => Self::InvalidRequest(format!("malformed conflict body: {body}")),
            },
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// The expected base in a 409 body: either a bare index or
/// `{"expectedBase": n}`.
fn parse_expected_base(body: &str) -> Option<u64> {
    if let Ok(n) = body.trim().parse::<u64>() {
        return Some(n);
    }
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("expectedBase")?.as_u64()
}

/// Fatal git-state conditions. Surfaced before any network I/O; the
/// gated operation aborts with local state untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitStateError {
    #[error("not a git repository")]
    NotARepo,
    #[error("no remote configured")]
    NoRemote,
    #[error("remote {remote} unreachable")]
    Unreachable { remote: String },
    #[error("HEAD is detached")]
    DetachedHead,
    #[error("commit not found: {reference}")]
    CommitNotFound { reference: String },
    #[error("repository at wrong commit: expected {expected}, found {actual}")]
    RepositoryMismatch { expected: String, actual: String },
}

impl GitStateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotARepo => "not_a_repo",
            Self::NoRemote => "no_remote",
            Self::Unreachable { .. } => "unreachable",
            Self::DetachedHead => "detached_head",
            Self::CommitNotFound { .. } => "commit_not_found",
            Self::RepositoryMismatch { .. } => "repository_mismatch",
        }
    }
}

/// Recoverable git-state conditions. The gated operation pauses until the
/// caller decides; without an explicit override it aborts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitStateWarning {
    /// Uncommitted local changes. Caller chooses stash/commit/cancel.
    Dirty { modified_files: Vec<String> },
    /// Local and remote have both advanced. Caller chooses how to reconcile.
    Divergent { ahead: u64, behind: u64 },
}

impl GitStateWarning {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dirty { .. } => "dirty",
            Self::Divergent { .. } => "divergent",
        }
    }
}

impl std::fmt::Display for GitStateWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dirty { modified_files } => {
                write!(f, "uncommitted changes in {} file(s)", modified_files.len())
            }
            Self::Divergent { ahead, behind } => {
                write!(f, "branch diverged: {ahead} ahead, {behind} behind")
            }
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}
