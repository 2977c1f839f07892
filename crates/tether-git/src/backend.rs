use async_trait::async_trait;

use crate::error::GitError;

/// Version-control operations the engine depends on.
///
/// Split in two halves: mutations used around save/resume (`commit`,
/// `push`, `checkout`, ...) and read-only probes the safety pipeline runs
/// before any of them. Implementations must be safe to call concurrently.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Paths with uncommitted changes (staged, unstaged, or untracked).
    /// Empty means the working tree is clean.
    async fn status(&self) -> Result<Vec<String>, GitError>;

    /// Stage all changes and commit them; returns the resulting commit
    /// hash. A clean tree is not an error — the current HEAD is returned.
    async fn commit(&self, message: &str) -> Result<String, GitError>;

    async fn push(&self, branch: &str) -> Result<(), GitError>;

    async fn fetch(&self) -> Result<(), GitError>;

    async fn checkout(&self, target: &str) -> Result<(), GitError>;

    async fn pull(&self, branch: &str) -> Result<(), GitError>;

    /// Resolve a reference to a commit hash. Unknown references fail with
    /// `GitError::NotFound`.
    async fn rev_parse(&self, reference: &str) -> Result<String, GitError>;

    /// Whether the working directory is inside a git repository.
    async fn is_repo(&self) -> bool;

    /// Configured remote URL, `None` when the repository has no remote.
    async fn remote_url(&self) -> Result<Option<String>, GitError>;

    /// Current branch name, `None` when HEAD is detached.
    async fn current_branch(&self) -> Result<Option<String>, GitError>;

    async fn is_detached(&self) -> Result<bool, GitError>;

    /// Commits (ahead, behind) relative to the current branch's upstream.
    /// A branch without an upstream reports (0, 0).
    async fn ahead_behind(&self) -> Result<(u64, u64), GitError>;

    /// Probe whether the remote answers at all. Callers are expected to
    /// bound this with a timeout.
    async fn remote_reachable(&self, remote: &str) -> Result<bool, GitError>;
}
