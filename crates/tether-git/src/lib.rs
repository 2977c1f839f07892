//! Version-control backend for tether: the `GitBackend` trait, a
//! subprocess implementation, a scriptable mock, and the pre-flight
//! safety pipeline.

pub mod backend;
pub mod error;
pub mod mock;
pub mod process;
pub mod verifier;

pub use backend::GitBackend;
pub use error::GitError;
pub use mock::MockGit;
pub use process::ProcessGit;
pub use verifier::{GitStateVerifier, VerifierConfig};
