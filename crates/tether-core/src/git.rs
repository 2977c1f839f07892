use serde::{Deserialize, Serialize};

use crate::errors::{GitStateError, GitStateWarning};

/// The commit/branch pair a boundary or session points at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub commit: String,
    pub branch: String,
}

impl GitState {
    pub fn new(commit: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            branch: branch.into(),
        }
    }
}

/// Result of the safety pipeline run before every save/resume.
/// Recomputed fresh each time; never persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GitSafetyCheck {
    pub is_repo: bool,
    pub has_remote: bool,
    pub has_uncommitted_changes: bool,
    pub is_online: bool,
    pub can_push: bool,
    pub warnings: Vec<GitStateWarning>,
    pub errors: Vec<GitStateError>,
}

impl GitSafetyCheck {
    /// No errors and no warnings: the gated operation may proceed as-is.
    pub fn is_ready(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// Errors block the operation unconditionally.
    pub fn is_blocked(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Warnings only: the caller must decide before the operation continues.
    pub fn needs_decision(&self) -> bool {
        self.errors.is_empty() && !self.warnings.is_empty()
    }

    /// Terminal pipeline state, for logging/metrics labels.
    pub fn outcome(&self) -> &'static str {
        if let Some(err) = self.errors.first() {
            return err.kind();
        }
        if let Some(warning) = self.warnings.first() {
            return warning.kind();
        }
        "ready"
    }
}
