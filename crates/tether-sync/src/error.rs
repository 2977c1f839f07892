use tether_core::errors::{GitStateError, GitStateWarning, SessionError, SyncError};
use tether_git::GitError;
use tether_store::StoreError;

/// Errors surfaced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// A gated operation refused to run because the safety check found a
    /// blocking condition.
    #[error("blocked by git state: {0}")]
    GitState(GitStateError),

    /// Warnings were found and the caller has not opted to proceed.
    #[error("unresolved git warnings: {}", format_warnings(.0))]
    WarningsPending(Vec<GitStateWarning>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::Git(_) => "git",
            Self::Session(_) => "session",
            Self::GitState(e) => e.kind(),
            Self::WarningsPending(_) => "warnings_pending",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Sync(SyncError::Cancelled))
    }
}

fn format_warnings(warnings: &[GitStateWarning]) -> String {
    warnings
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
