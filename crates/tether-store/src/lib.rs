//! SQLite persistence for tether: conversations, append-only message
//! streams, sync watermarks, git boundaries, and saved sessions.

pub mod boundaries;
pub mod conversations;
pub mod database;
pub mod devices;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod sync_state;

pub use database::Database;
pub use error::StoreError;
