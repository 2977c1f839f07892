use tracing::{debug, instrument};

use tether_core::errors::GitStateError;
use tether_core::git::GitState;
use tether_core::ids::ConversationId;
use tether_git::{GitBackend, GitError};
use tether_store::boundaries::{BoundaryRecord, BoundaryRepo};
use tether_store::sessions::SessionRow;
use tether_store::{Database, StoreError};

use crate::error::EngineError;

/// Ties conversation positions to git history.
///
/// A boundary marks the message index at which the repository moved to a
/// new commit or branch. Boundaries are only appended when the git state
/// actually changed, so consecutive saves on the same commit share one.
pub struct SessionLinker {
    boundaries: BoundaryRepo,
}

impl SessionLinker {
    pub fn new(db: Database) -> Self {
        Self {
            boundaries: BoundaryRepo::new(db),
        }
    }

    /// Record a boundary at `message_index` unless the latest boundary
    /// already points at the same commit and branch. Returns the new record,
    /// or `None` when nothing changed.
    #[instrument(skip(self, git_state), fields(conversation_id = %conversation_id, message_index))]
    pub fn record_boundary(
        &self,
        conversation_id: &ConversationId,
        message_index: u64,
        git_state: &GitState,
    ) -> Result<Option<BoundaryRecord>, StoreError> {
        if let Some(latest) = self.boundaries.latest(conversation_id)? {
            if latest.git_state == *git_state {
                debug!("git state unchanged, boundary not recorded");
                return Ok(None);
            }
        }

        let record = self
            .boundaries
            .append(conversation_id, message_index, git_state)?;
        debug!(commit = %record.git_state.commit, "boundary recorded");
        Ok(Some(record))
    }

    /// All boundaries for a conversation, oldest first.
    pub fn boundaries(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<BoundaryRecord>, StoreError> {
        self.boundaries.list(conversation_id)
    }

    /// The boundary governing a message index: the code state the
    /// conversation was in when that message was written.
    pub fn boundary_for_index(
        &self,
        conversation_id: &ConversationId,
        message_index: u64,
    ) -> Result<Option<BoundaryRecord>, StoreError> {
        self.boundaries.for_index(conversation_id, message_index)
    }

    /// Confirm the working tree is actually at the session's commit before
    /// a resume proceeds. Catches commits lost to history rewrites as well
    /// as checkouts that silently landed somewhere else.
    pub async fn verify_resume_target(
        &self,
        git: &dyn GitBackend,
        session: &SessionRow,
    ) -> Result<(), EngineError> {
        match git.rev_parse(&session.git_commit).await {
            Ok(_) => {}
            Err(GitError::NotFound(reference)) => {
                return Err(EngineError::GitState(GitStateError::CommitNotFound {
                    reference,
                }));
            }
            Err(e) => return Err(EngineError::Git(e)),
        }

        let head = git.rev_parse("HEAD").await?;
        if head != session.git_commit {
            return Err(EngineError::GitState(GitStateError::RepositoryMismatch {
                expected: session.git_commit.clone(),
                actual: head,
            }));
        }
        Ok(())
    }
}
