/// Failures from the version-control backend itself. The safety pipeline
/// translates probe outcomes into `GitStateError`/`GitStateWarning` values;
/// this type covers the layer below (the subprocess or mock misbehaving).
#[derive(Clone, Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("reference not found: {0}")]
    NotFound(String),
    #[error("failed to run git: {0}")]
    Io(String),
}
