use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use tether_core::errors::{GitStateError, GitStateWarning};
use tether_core::git::GitSafetyCheck;

use crate::backend::GitBackend;
use crate::error::GitError;

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Deadline for the remote reachability probe.
    pub reachability_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            reachability_timeout: Duration::from_secs(5),
        }
    }
}

/// Pre-flight safety pipeline run before every save/resume.
///
/// Checks run in a fixed order; the first failing repository-shape check
/// (missing repo, missing remote, unreachable remote, detached HEAD) is
/// terminal and skips the rest. Working-tree checks (dirty, divergent)
/// accumulate as warnings instead. The result is computed fresh on every
/// call and never persisted.
pub struct GitStateVerifier {
    backend: Arc<dyn GitBackend>,
    config: VerifierConfig,
}

impl GitStateVerifier {
    pub fn new(backend: Arc<dyn GitBackend>) -> Self {
        Self::with_config(backend, VerifierConfig::default())
    }

    pub fn with_config(backend: Arc<dyn GitBackend>, config: VerifierConfig) -> Self {
        Self { backend, config }
    }

    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<GitSafetyCheck, GitError> {
        let mut check = GitSafetyCheck::default();

        if !self.backend.is_repo().await {
            check.errors.push(GitStateError::NotARepo);
            return Ok(check);
        }
        check.is_repo = true;

        let Some(remote) = self.backend.remote_url().await? else {
            check.errors.push(GitStateError::NoRemote);
            return Ok(check);
        };
        check.has_remote = true;

        let reachable = match tokio::time::timeout(
            self.config.reachability_timeout,
            self.backend.remote_reachable(&remote),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                debug!(remote, "reachability probe timed out");
                false
            }
        };
        if !reachable {
            check.errors.push(GitStateError::Unreachable { remote });
            return Ok(check);
        }
        check.is_online = true;

        if self.backend.is_detached().await? {
            check.errors.push(GitStateError::DetachedHead);
            return Ok(check);
        }

        let modified_files = self.backend.status().await?;
        if !modified_files.is_empty() {
            check.has_uncommitted_changes = true;
            check.warnings.push(GitStateWarning::Dirty { modified_files });
        }

        let (ahead, behind) = self.backend.ahead_behind().await?;
        if ahead > 0 && behind > 0 {
            check.warnings.push(GitStateWarning::Divergent { ahead, behind });
        }
        check.can_push = behind == 0;

        debug!(outcome = check.outcome(), "safety check complete");
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGit;

    fn verifier(git: Arc<MockGit>) -> GitStateVerifier {
        GitStateVerifier::new(git)
    }

    #[tokio::test]
    async fn clean_repo_is_ready() {
        let check = verifier(Arc::new(MockGit::ready())).check().await.unwrap();
        assert!(check.is_ready());
        assert!(check.is_repo);
        assert!(check.has_remote);
        assert!(check.is_online);
        assert!(check.can_push);
        assert_eq!(check.outcome(), "ready");
    }

    #[tokio::test]
    async fn missing_repo_stops_pipeline() {
        let git = Arc::new(MockGit::not_a_repo());
        let check = verifier(git.clone()).check().await.unwrap();
        assert_eq!(check.errors, vec![GitStateError::NotARepo]);
        assert!(check.is_blocked());
        // Terminal: no later probe runs.
        assert_eq!(git.call_count("remote_url"), 0);
        assert_eq!(git.call_count("status"), 0);
    }

    #[tokio::test]
    async fn missing_remote() {
        let git = Arc::new(MockGit::ready());
        git.set_remote(None);
        let check = verifier(git.clone()).check().await.unwrap();
        assert_eq!(check.errors, vec![GitStateError::NoRemote]);
        assert!(check.is_repo);
        assert!(!check.has_remote);
        assert_eq!(git.call_count("remote_reachable"), 0);
    }

    #[tokio::test]
    async fn unreachable_remote() {
        let git = Arc::new(MockGit::ready());
        git.set_reachable(false);
        let check = verifier(git.clone()).check().await.unwrap();
        assert!(matches!(
            check.errors.first(),
            Some(GitStateError::Unreachable { remote }) if remote.contains("example.com")
        ));
        assert!(!check.is_online);
        assert_eq!(git.call_count("is_detached"), 0);
    }

    #[tokio::test]
    async fn slow_reachability_probe_times_out() {
        let git = Arc::new(MockGit::ready());
        git.set_reachability_delay(Duration::from_millis(100));
        let verifier = GitStateVerifier::with_config(
            git,
            VerifierConfig {
                reachability_timeout: Duration::from_millis(10),
            },
        );
        let check = verifier.check().await.unwrap();
        assert!(matches!(
            check.errors.first(),
            Some(GitStateError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn detached_head() {
        let git = Arc::new(MockGit::ready());
        git.set_detached(true);
        let check = verifier(git.clone()).check().await.unwrap();
        assert_eq!(check.errors, vec![GitStateError::DetachedHead]);
        // Warnings are never collected once an error is terminal.
        assert_eq!(git.call_count("status"), 0);
    }

    #[tokio::test]
    async fn dirty_tree_is_a_warning_not_an_error() {
        let git = Arc::new(MockGit::ready());
        git.set_modified(&["src/main.rs", "Cargo.toml"]);
        let check = verifier(git).check().await.unwrap();
        assert!(check.errors.is_empty());
        assert!(check.has_uncommitted_changes);
        assert!(check.needs_decision());
        assert!(matches!(
            check.warnings.first(),
            Some(GitStateWarning::Dirty { modified_files }) if modified_files.len() == 2
        ));
    }

    #[tokio::test]
    async fn divergent_branch_is_a_warning() {
        let git = Arc::new(MockGit::ready());
        git.set_ahead_behind(2, 3);
        let check = verifier(git).check().await.unwrap();
        assert_eq!(
            check.warnings,
            vec![GitStateWarning::Divergent { ahead: 2, behind: 3 }]
        );
        assert!(!check.can_push);
    }

    #[tokio::test]
    async fn ahead_only_is_not_divergent() {
        let git = Arc::new(MockGit::ready());
        git.set_ahead_behind(5, 0);
        let check = verifier(git).check().await.unwrap();
        assert!(check.is_ready());
        assert!(check.can_push);
    }

    #[tokio::test]
    async fn behind_only_is_not_divergent_but_blocks_push() {
        let git = Arc::new(MockGit::ready());
        git.set_ahead_behind(0, 4);
        let check = verifier(git).check().await.unwrap();
        assert!(check.warnings.is_empty());
        assert!(!check.can_push);
    }

    #[tokio::test]
    async fn dirty_and_divergent_both_reported() {
        let git = Arc::new(MockGit::ready());
        git.set_modified(&["a.rs"]);
        git.set_ahead_behind(1, 1);
        let check = verifier(git).check().await.unwrap();
        assert_eq!(check.warnings.len(), 2);
        assert_eq!(check.outcome(), "dirty");
    }

    #[tokio::test]
    async fn fresh_check_reflects_state_changes() {
        let git = Arc::new(MockGit::ready());
        let verifier = verifier(git.clone());

        let first = verifier.check().await.unwrap();
        assert!(first.is_ready());

        git.set_modified(&["src/lib.rs"]);
        let second = verifier.check().await.unwrap();
        assert!(second.needs_decision());
    }
}
