use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::instrument;

use tether_core::ids::{ConversationId, MessageId};
use tether_core::message::{GitContext, Message};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-conversation append lock.
/// Ensures index assignment is linearized: indices are dense and in
/// creation order, with no gaps or duplicates.
struct ConversationLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// The append-only message stream store.
/// Sole owner of message index assignment for a conversation.
pub struct MessageRepo {
    db: Database,
    conversation_locks: Mutex<ConversationLocks>,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            conversation_locks: Mutex::new(ConversationLocks::new()),
        }
    }

    /// Append a message, assigning the next sequential index.
    /// Rejects messages whose timestamp is earlier than the current tail
    /// rather than reordering them.
    #[instrument(skip(self, message), fields(conversation_id = %conversation_id))]
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<u64, StoreError> {
        let lock = self
            .conversation_locks
            .lock()
            .get(conversation_id.as_str());
        let _guard = lock.lock();

        self.db
            .with_conn(|conn| append_one(conn, conversation_id, message))
    }

    /// Append a batch of messages in order under a single lock acquisition.
    /// Validates the whole batch against the tail before writing anything.
    /// Returns the new stream length.
    #[instrument(skip(self, messages), fields(conversation_id = %conversation_id, count = messages.len()))]
    pub fn append_all(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<u64, StoreError> {
        let lock = self
            .conversation_locks
            .lock()
            .get(conversation_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let (mut next_idx, tail_ts) = tail_of(conn, conversation_id)?;

            // Validate ordering across the whole batch first
            let mut prev_ts = tail_ts;
            for message in messages {
                if let Some(prev) = prev_ts {
                    if message.timestamp < prev {
                        return Err(StoreError::InvalidAppend(format!(
                            "timestamp {} earlier than tail {}",
                            message.timestamp.to_rfc3339(),
                            prev.to_rfc3339()
                        )));
                    }
                }
                prev_ts = Some(message.timestamp);
            }

            for message in messages {
                insert_message(conn, conversation_id, next_idx, message)?;
                next_idx += 1;
            }

            if !messages.is_empty() {
                touch_conversation(conn, conversation_id)?;
            }

            Ok(next_idx as u64)
        })
    }

    /// Messages in `[start, end)`, ordered by index.
    pub fn range(
        &self,
        conversation_id: &ConversationId,
        start: u64,
        end: u64,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let length = count(conn, conversation_id)?;
            if end > length {
                return Err(StoreError::OutOfRange { start, end, length });
            }

            let mut stmt = conn.prepare(
                "SELECT id, role, content, timestamp, git_commit, git_branch, git_repository, git_modified_files
                 FROM messages WHERE conversation_id = ?1 AND idx >= ?2 AND idx < ?3
                 ORDER BY idx ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                conversation_id.as_str(),
                start as i64,
                end as i64
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Current stream length. Indices are dense, so this equals tail+1.
    pub fn length(&self, conversation_id: &ConversationId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| count(conn, conversation_id))
    }
}

fn append_one(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
    message: &Message,
) -> Result<u64, StoreError> {
    let (next_idx, tail_ts) = tail_of(conn, conversation_id)?;

    if let Some(tail_ts) = tail_ts {
        if message.timestamp < tail_ts {
            return Err(StoreError::InvalidAppend(format!(
                "timestamp {} earlier than tail {}",
                message.timestamp.to_rfc3339(),
                tail_ts.to_rfc3339()
            )));
        }
    }

    insert_message(conn, conversation_id, next_idx, message)?;
    touch_conversation(conn, conversation_id)?;

    Ok(next_idx as u64)
}

/// Next free index plus the tail timestamp, verifying the conversation exists.
fn tail_of(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
) -> Result<(i64, Option<chrono::DateTime<Utc>>), StoreError> {
    let conv_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE id = ?1",
        [conversation_id.as_str()],
        |row| row.get(0),
    )?;
    if conv_count == 0 {
        return Err(StoreError::NotFound(format!(
            "conversation {conversation_id}"
        )));
    }

    let tail: Option<(i64, String)> = conn
        .query_row(
            "SELECT idx, timestamp FROM messages WHERE conversation_id = ?1
             ORDER BY idx DESC LIMIT 1",
            [conversation_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();

    match tail {
        Some((idx, raw_ts)) => {
            let ts = row_helpers::parse_timestamp(&raw_ts, "messages", "timestamp")?;
            Ok((idx + 1, Some(ts)))
        }
        None => Ok((0, None)),
    }
}

fn insert_message(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
    idx: i64,
    message: &Message,
) -> Result<(), StoreError> {
    let (git_commit, git_branch, git_repository, git_modified_files) = match &message.git_context {
        Some(ctx) => (
            Some(ctx.commit.as_str()),
            Some(ctx.branch.as_str()),
            Some(ctx.repository.as_str()),
            Some(serde_json::to_string(&ctx.modified_files)?),
        ),
        None => (None, None, None, None),
    };

    conn.execute(
        "INSERT INTO messages (id, conversation_id, idx, role, content, timestamp,
                               git_commit, git_branch, git_repository, git_modified_files)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            message.id.as_str(),
            conversation_id.as_str(),
            idx,
            message.role.to_string(),
            message.content,
            message.timestamp.to_rfc3339(),
            git_commit,
            git_branch,
            git_repository,
            git_modified_files,
        ],
    )?;
    Ok(())
}

fn touch_conversation(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![Utc::now().to_rfc3339(), conversation_id.as_str()],
    )?;
    Ok(())
}

fn count(
    conn: &rusqlite::Connection,
    conversation_id: &ConversationId,
) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
        [conversation_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role_str: String = row_helpers::get(row, 1, "messages", "role")?;
    let ts_raw: String = row_helpers::get(row, 3, "messages", "timestamp")?;

    let git_commit: Option<String> = row_helpers::get_opt(row, 4, "messages", "git_commit")?;
    let git_branch: Option<String> = row_helpers::get_opt(row, 5, "messages", "git_branch")?;
    let git_repository: Option<String> =
        row_helpers::get_opt(row, 6, "messages", "git_repository")?;
    let git_modified_files: Option<String> =
        row_helpers::get_opt(row, 7, "messages", "git_modified_files")?;

    let git_context = match (git_commit, git_branch, git_repository) {
        (Some(commit), Some(branch), Some(repository)) => {
            let modified_files = match git_modified_files {
                Some(raw) => row_helpers::parse_json(&raw, "messages", "git_modified_files")?,
                None => Vec::new(),
            };
            Some(GitContext {
                commit,
                branch,
                repository,
                modified_files,
            })
        }
        (None, None, None) => None,
        _ => {
            return Err(StoreError::CorruptRow {
                table: "messages",
                column: "git_commit",
                detail: "partial git context".into(),
            })
        }
    };

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::get(row, 2, "messages", "content")?,
        timestamp: row_helpers::parse_timestamp(&ts_raw, "messages", "timestamp")?,
        git_context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use chrono::Duration;
    use tether_core::message::Role;

    fn setup() -> (Database, ConversationId) {
        let db = Database::in_memory().unwrap();
        let conv_repo = ConversationRepo::new(db.clone());
        let conv = conv_repo.create(Some("test")).unwrap();
        (db, conv.id)
    }

    fn ctx() -> GitContext {
        GitContext {
            commit: "abc123".into(),
            branch: "main".into(),
            repository: "git@example.com:a/b.git".into(),
            modified_files: vec!["src/lib.rs".into()],
        }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let i0 = repo.append(&conv_id, &Message::user("one")).unwrap();
        let i1 = repo.append(&conv_id, &Message::assistant("two")).unwrap();
        let i2 = repo.append(&conv_id, &Message::user("three")).unwrap();

        assert_eq!((i0, i1, i2), (0, 1, 2));
        assert_eq!(repo.length(&conv_id).unwrap(), 3);
    }

    #[test]
    fn append_to_missing_conversation_fails() {
        let db = Database::in_memory().unwrap();
        let repo = MessageRepo::new(db);
        let result = repo.append(
            &ConversationId::from_raw("conv_nonexistent"),
            &Message::user("hello"),
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_rejects_earlier_timestamp() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        repo.append(&conv_id, &Message::user("first")).unwrap();

        let mut stale = Message::user("stale");
        stale.timestamp = Utc::now() - Duration::hours(1);
        let result = repo.append(&conv_id, &stale);
        assert!(matches!(result, Err(StoreError::InvalidAppend(_))));

        // Rejected append must not consume an index
        assert_eq!(repo.length(&conv_id).unwrap(), 1);
    }

    #[test]
    fn append_allows_equal_timestamp() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let first = Message::user("first");
        repo.append(&conv_id, &first).unwrap();

        let mut same_instant = Message::assistant("same instant");
        same_instant.timestamp = first.timestamp;
        assert_eq!(repo.append(&conv_id, &same_instant).unwrap(), 1);
    }

    #[test]
    fn range_returns_messages_in_order() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        for i in 0..5 {
            repo.append(&conv_id, &Message::user(format!("msg {i}")))
                .unwrap();
        }

        let middle = repo.range(&conv_id, 1, 4).unwrap();
        assert_eq!(middle.len(), 3);
        assert_eq!(middle[0].content, "msg 1");
        assert_eq!(middle[2].content, "msg 3");
    }

    #[test]
    fn range_end_beyond_length_fails() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        repo.append(&conv_id, &Message::user("only")).unwrap();

        let result = repo.range(&conv_id, 0, 2);
        assert!(matches!(
            result,
            Err(StoreError::OutOfRange { end: 2, length: 1, .. })
        ));
    }

    #[test]
    fn empty_range_is_empty() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        repo.append(&conv_id, &Message::user("one")).unwrap();
        assert!(repo.range(&conv_id, 1, 1).unwrap().is_empty());
    }

    #[test]
    fn append_all_batch() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let batch: Vec<Message> = (0..4).map(|i| Message::user(format!("m{i}"))).collect();
        let new_len = repo.append_all(&conv_id, &batch).unwrap();
        assert_eq!(new_len, 4);

        let more: Vec<Message> = (4..6).map(|i| Message::assistant(format!("m{i}"))).collect();
        let new_len = repo.append_all(&conv_id, &more).unwrap();
        assert_eq!(new_len, 6);

        let all = repo.range(&conv_id, 0, 6).unwrap();
        assert_eq!(all[4].content, "m4");
    }

    #[test]
    fn append_all_rejects_unordered_batch_without_writing() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let ok = Message::user("ok");
        let mut stale = Message::user("stale");
        stale.timestamp = ok.timestamp - Duration::minutes(5);

        let result = repo.append_all(&conv_id, &[ok, stale]);
        assert!(matches!(result, Err(StoreError::InvalidAppend(_))));
        assert_eq!(repo.length(&conv_id).unwrap(), 0);
    }

    #[test]
    fn message_roundtrip_preserves_fields() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let msg = Message::new(Role::Assistant, "with context", Some(ctx()));
        repo.append(&conv_id, &msg).unwrap();

        let fetched = repo.range(&conv_id, 0, 1).unwrap();
        assert_eq!(fetched[0], msg);
    }

    #[test]
    fn message_without_git_context_roundtrips() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        let msg = Message::system("bare");
        repo.append(&conv_id, &msg).unwrap();

        let fetched = repo.range(&conv_id, 0, 1).unwrap();
        assert!(fetched[0].git_context.is_none());
    }

    #[test]
    fn partial_git_context_returns_corrupt_row() {
        let (db, conv_id) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, idx, role, content, timestamp, git_commit)
                 VALUES (?1, ?2, 0, 'user', 'x', ?3, 'abc')",
                rusqlite::params![
                    MessageId::new().as_str(),
                    conv_id.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = MessageRepo::new(db);
        let result = repo.range(&conv_id, 0, 1);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }

    #[test]
    fn concurrent_appends_linearized() {
        // Concurrent appends to the same conversation must produce dense,
        // unique indices. All messages share one timestamp so ordering
        // validation accepts any interleaving.
        let (db, conv_id) = setup();
        let repo = Arc::new(MessageRepo::new(db));

        let now = Utc::now();
        let mut handles = vec![];
        for i in 0..10 {
            let repo = repo.clone();
            let cid = conv_id.clone();
            let mut msg = Message::user(format!("thread {i}"));
            msg.timestamp = now;
            handles.push(std::thread::spawn(move || repo.append(&cid, &msg).unwrap()));
        }

        let mut indices: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort();
        assert_eq!(indices, (0..10).collect::<Vec<u64>>());
        assert_eq!(repo.length(&conv_id).unwrap(), 10);
    }
}
