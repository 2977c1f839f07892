pub mod errors;
pub mod events;
pub mod git;
pub mod ids;
pub mod message;
pub mod sync;

pub use errors::{GitStateError, GitStateWarning, SessionError, SyncError};
pub use events::{SyncEvent, SyncKind};
pub use git::{GitSafetyCheck, GitState};
pub use ids::{ConversationId, DeltaId, DeviceId, MessageId, SessionId, SnapshotId};
pub use message::{GitContext, Message, Role};
pub use sync::{CompressionStats, SyncMetadata};
