use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::GitState;
use crate::ids::MessageId;

/// A single entry in a conversation's append-only stream.
/// Immutable once appended; never edited or deleted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_context: Option<GitContext>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Code state captured at message-creation time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GitContext {
    pub commit: String,
    pub branch: String,
    pub repository: String,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

impl GitContext {
    /// The commit/branch pair used for boundary comparison.
    pub fn state(&self) -> GitState {
        GitState {
            commit: self.commit.clone(),
            branch: self.branch.clone(),
        }
    }
}

// --- Convenience constructors ---

impl Message {
    pub fn new(role: Role, content: impl Into<String>, git_context: Option<GitContext>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            git_context,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, None)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, None)
    }

    pub fn with_git_context(mut self, ctx: GitContext) -> Self {
        self.git_context = Some(ctx);
        self
    }
}
