/// SQL DDL for the tether-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL UNIQUE,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    idx INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    git_commit TEXT,
    git_branch TEXT,
    git_repository TEXT,
    git_modified_files TEXT
);

CREATE TABLE IF NOT EXISTS sync_state (
    conversation_id TEXT PRIMARY KEY REFERENCES conversations(id),
    last_synced_message_index INTEGER NOT NULL DEFAULT 0,
    last_snapshot_index INTEGER NOT NULL DEFAULT 0,
    last_synced_timestamp TEXT,
    total_messages INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS boundaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    message_index INTEGER NOT NULL,
    git_commit TEXT NOT NULL,
    git_branch TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    device_id TEXT NOT NULL REFERENCES devices(id),
    git_commit TEXT NOT NULL,
    branch TEXT NOT NULL,
    repository_url TEXT NOT NULL,
    working_directory TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conversation_idx ON messages(conversation_id, idx);
CREATE INDEX IF NOT EXISTS idx_boundaries_conversation ON boundaries(conversation_id, message_index);
CREATE INDEX IF NOT EXISTS idx_sessions_conversation ON sessions(conversation_id);
CREATE INDEX IF NOT EXISTS idx_sessions_device ON sessions(device_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
