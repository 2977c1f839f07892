//! Conversation sync engine: plans snapshot/delta uploads, merges remote
//! streams, and gates save/resume on repository state.

pub mod codec;
pub mod coordinator;
pub mod error;
pub mod linker;
pub mod retry;

pub use codec::SyncPlan;
pub use coordinator::{
    DownloadOutcome, ResumeOutcome, SaveOutcome, SyncConfig, SyncCoordinator, UploadOutcome,
    WarningResolution,
};
pub use error::EngineError;
pub use linker::SessionLinker;
pub use retry::{Retry, RetryConfig};
