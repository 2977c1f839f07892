use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::GitBackend;
use crate::error::GitError;

/// Scriptable repository state for deterministic testing without a real
/// working tree.
#[derive(Clone, Debug)]
pub struct MockGitState {
    pub is_repo: bool,
    pub remote: Option<String>,
    pub reachable: bool,
    /// Wait this long before answering the reachability probe.
    pub reachability_delay: Option<Duration>,
    pub detached: bool,
    pub branch: String,
    pub head: String,
    pub modified_files: Vec<String>,
    pub ahead: u64,
    pub behind: u64,
    pub known_commits: Vec<String>,
}

impl Default for MockGitState {
    fn default() -> Self {
        Self {
            is_repo: true,
            remote: Some("git@example.com:me/project.git".into()),
            reachable: true,
            reachability_delay: None,
            detached: false,
            branch: "main".into(),
            head: "abc123".into(),
            modified_files: Vec::new(),
            ahead: 0,
            behind: 0,
            known_commits: vec!["abc123".into()],
        }
    }
}

/// Mock backend over a `MockGitState`, recording every call so tests can
/// assert which probes ran (and which didn't).
pub struct MockGit {
    state: Mutex<MockGitState>,
    calls: Mutex<Vec<String>>,
}

impl MockGit {
    /// Clean, reachable repository on `main` at commit `abc123`.
    pub fn ready() -> Self {
        Self::with_state(MockGitState::default())
    }

    pub fn not_a_repo() -> Self {
        Self::with_state(MockGitState {
            is_repo: false,
            ..Default::default()
        })
    }

    pub fn with_state(state: MockGitState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_modified(&self, files: &[&str]) {
        self.state.lock().modified_files = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_ahead_behind(&self, ahead: u64, behind: u64) {
        let mut state = self.state.lock();
        state.ahead = ahead;
        state.behind = behind;
    }

    pub fn set_detached(&self, detached: bool) {
        self.state.lock().detached = detached;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn set_reachability_delay(&self, delay: Duration) {
        self.state.lock().reachability_delay = Some(delay);
    }

    pub fn set_remote(&self, remote: Option<&str>) {
        self.state.lock().remote = remote.map(String::from);
    }

    /// Move HEAD to a commit, registering it as known.
    pub fn set_head(&self, commit: &str) {
        let mut state = self.state.lock();
        state.head = commit.to_string();
        if !state.known_commits.iter().any(|c| c == commit) {
            state.known_commits.push(commit.to_string());
        }
    }

    pub fn add_commit(&self, commit: &str) {
        self.state.lock().known_commits.push(commit.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == op).count()
    }

    fn record(&self, op: &str) {
        self.calls.lock().push(op.to_string());
    }
}

#[async_trait]
impl GitBackend for MockGit {
    async fn status(&self) -> Result<Vec<String>, GitError> {
        self.record("status");
        Ok(self.state.lock().modified_files.clone())
    }

    async fn commit(&self, _message: &str) -> Result<String, GitError> {
        self.record("commit");
        let mut state = self.state.lock();
        if state.modified_files.is_empty() {
            return Ok(state.head.clone());
        }
        let hash = format!("mock{:04}", state.known_commits.len());
        state.head = hash.clone();
        state.known_commits.push(hash.clone());
        state.modified_files.clear();
        Ok(hash)
    }

    async fn push(&self, _branch: &str) -> Result<(), GitError> {
        self.record("push");
        self.state.lock().ahead = 0;
        Ok(())
    }

    async fn fetch(&self) -> Result<(), GitError> {
        self.record("fetch");
        Ok(())
    }

    async fn checkout(&self, target: &str) -> Result<(), GitError> {
        self.record("checkout");
        let mut state = self.state.lock();
        if target == state.branch {
            state.detached = false;
            return Ok(());
        }
        if state.known_commits.iter().any(|c| c == target) {
            state.head = target.to_string();
            state.detached = true;
            return Ok(());
        }
        Err(GitError::NotFound(target.to_string()))
    }

    async fn pull(&self, _branch: &str) -> Result<(), GitError> {
        self.record("pull");
        self.state.lock().behind = 0;
        Ok(())
    }

    async fn rev_parse(&self, reference: &str) -> Result<String, GitError> {
        self.record("rev_parse");
        let state = self.state.lock();
        if reference == "HEAD" || reference == state.branch {
            return Ok(state.head.clone());
        }
        if state.known_commits.iter().any(|c| c == reference) {
            return Ok(reference.to_string());
        }
        Err(GitError::NotFound(reference.to_string()))
    }

    async fn is_repo(&self) -> bool {
        self.record("is_repo");
        self.state.lock().is_repo
    }

    async fn remote_url(&self) -> Result<Option<String>, GitError> {
        self.record("remote_url");
        Ok(self.state.lock().remote.clone())
    }

    async fn current_branch(&self) -> Result<Option<String>, GitError> {
        self.record("current_branch");
        let state = self.state.lock();
        if state.detached {
            Ok(None)
        } else {
            Ok(Some(state.branch.clone()))
        }
    }

    async fn is_detached(&self) -> Result<bool, GitError> {
        self.record("is_detached");
        Ok(self.state.lock().detached)
    }

    async fn ahead_behind(&self) -> Result<(u64, u64), GitError> {
        self.record("ahead_behind");
        let state = self.state.lock();
        Ok((state.ahead, state.behind))
    }

    async fn remote_reachable(&self, _remote: &str) -> Result<bool, GitError> {
        self.record("remote_reachable");
        let (delay, reachable) = {
            let state = self.state.lock();
            (state.reachability_delay, state.reachable)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(reachable)
    }
}
