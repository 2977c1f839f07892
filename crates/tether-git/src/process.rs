use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};

use crate::backend::GitBackend;
use crate::error::GitError;

/// Reject URLs that could be parsed as git options or smuggle shell
/// metacharacters into a subprocess argument.
fn is_safe_remote_url(url: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(https://[a-zA-Z0-9._-]+(:\d+)?/|git@[a-zA-Z0-9._-]+:|ssh://git@[a-zA-Z0-9._-]+(:\d+)?/)[a-zA-Z0-9._/-]+(\.git)?$",
        )
        .expect("valid regex")
    })
    .is_match(url)
}

/// Extract changed paths from `git status --porcelain` output. Renames
/// report the new path.
fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            match path.split_once(" -> ") {
                Some((_, renamed)) => renamed.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

/// Parse `git rev-list --left-right --count HEAD...@{upstream}` output
/// ("ahead<TAB>behind").
fn parse_ahead_behind(output: &str) -> Option<(u64, u64)> {
    let mut parts = output.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

/// Git backend that shells out to the `git` binary in a fixed working
/// directory.
pub struct ProcessGit {
    dir: PathBuf,
}

impl ProcessGit {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.dir)
            .args(args)
            .output()
            .await
            .map_err(|e| GitError::Io(format!("failed to execute git: {e}")))
    }

    /// Run a git command that must succeed; returns trimmed stdout.
    async fn run_ok(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or("git").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitBackend for ProcessGit {
    async fn status(&self) -> Result<Vec<String>, GitError> {
        let output = self.run_ok(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&output))
    }

    #[instrument(skip(self, message))]
    async fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run_ok(&["add", "-A"]).await?;

        let output = self.run(&["commit", "-m", message]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            // "nothing to commit" is not a real error
            if !stdout.contains("nothing to commit") && !stderr.contains("nothing to commit") {
                return Err(GitError::CommandFailed {
                    command: "commit".into(),
                    stderr: stderr.trim().to_string(),
                });
            }
        }

        self.rev_parse("HEAD").await
    }

    #[instrument(skip(self))]
    async fn push(&self, branch: &str) -> Result<(), GitError> {
        self.run_ok(&["push", "origin", branch]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<(), GitError> {
        self.run_ok(&["fetch", "--quiet"]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn checkout(&self, target: &str) -> Result<(), GitError> {
        self.run_ok(&["checkout", "--quiet", target]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pull(&self, branch: &str) -> Result<(), GitError> {
        self.run_ok(&["pull", "--no-edit", "origin", branch]).await?;
        Ok(())
    }

    async fn rev_parse(&self, reference: &str) -> Result<String, GitError> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", reference])
            .await?;
        if !output.status.success() {
            return Err(GitError::NotFound(reference.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn remote_url(&self) -> Result<Option<String>, GitError> {
        let remotes = self.run_ok(&["remote"]).await?;
        let Some(name) = remotes.lines().next().map(str::trim).filter(|n| !n.is_empty())
        else {
            return Ok(None);
        };
        let url = self.run_ok(&["remote", "get-url", name]).await?;
        Ok(Some(url))
    }

    async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let branch = self.run_ok(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if branch == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(branch))
        }
    }

    async fn is_detached(&self) -> Result<bool, GitError> {
        let output = self.run(&["symbolic-ref", "-q", "HEAD"]).await?;
        Ok(!output.status.success())
    }

    async fn ahead_behind(&self) -> Result<(u64, u64), GitError> {
        let output = self
            .run(&["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])
            .await?;
        if !output.status.success() {
            // No upstream configured for this branch.
            debug!("no upstream for current branch, treating as in sync");
            return Ok((0, 0));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ahead_behind(&stdout).ok_or_else(|| GitError::CommandFailed {
            command: "rev-list".into(),
            stderr: format!("unparseable count output: {stdout}"),
        })
    }

    async fn remote_reachable(&self, remote: &str) -> Result<bool, GitError> {
        if !is_safe_remote_url(remote) {
            debug!(remote, "refusing to probe non-URL remote");
            return Ok(false);
        }
        let output = self
            .run(&["ls-remote", "--exit-code", remote, "HEAD"])
            .await?;
        Ok(output.status.success())
    }
}
