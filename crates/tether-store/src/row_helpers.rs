use chrono::{DateTime, Utc};

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.into(),
    }
}

/// Required column value; CorruptRow on index or type mismatch.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx)
        .map_err(|e| corrupt(table, column, e.to_string()))
}

/// Nullable column value. FromSql on Option<T> maps NULL to None.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Deserialize a JSON text column.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("invalid JSON: {e}")))
}

/// Parse a text column into a FromStr enum.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unknown variant: {raw}")))
}

/// Parse an RFC 3339 timestamp column into UTC.
pub fn parse_timestamp(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(table, column, format!("invalid timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use tether_core::message::Role;

    #[test]
    fn typed_column_reads() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (n INTEGER, s TEXT); INSERT INTO t VALUES (5, 'abc');")
            .unwrap();

        let (n, s) = conn
            .query_row("SELECT n, s FROM t", [], |row| {
                Ok((
                    get::<i64>(row, 0, "t", "n"),
                    get_opt::<String>(row, 1, "t", "s"),
                ))
            })
            .unwrap();
        assert_eq!(n.unwrap(), 5);
        assert_eq!(s.unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn type_mismatch_is_corrupt_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (s TEXT); INSERT INTO t VALUES ('abc');")
            .unwrap();

        let result = conn
            .query_row("SELECT s FROM t", [], |row| Ok(get::<i64>(row, 0, "t", "s")))
            .unwrap();
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "t", column: "s", .. })
        ));
    }

    #[test]
    fn enum_column_parses() {
        let result: Result<Role, _> = parse_enum("assistant", "messages", "role");
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_variant_is_corrupt_row() {
        let result: Result<Role, _> = parse_enum("INVALID", "messages", "role");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "role", .. })
        ));
    }

    #[test]
    fn json_column_parses() {
        let files: Vec<String> =
            parse_json(r#"["src/lib.rs", "Cargo.toml"]"#, "messages", "git_modified_files")
                .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn malformed_json_is_corrupt_row() {
        let result: Result<Vec<String>, _> =
            parse_json("not valid json", "messages", "git_modified_files");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "git_modified_files", .. })
        ));
    }

    #[test]
    fn timestamp_column_parses() {
        let ts = parse_timestamp("2026-08-25T10:30:00+00:00", "messages", "timestamp").unwrap();
        assert_eq!(ts.timezone(), Utc);
    }

    #[test]
    fn malformed_timestamp_is_corrupt_row() {
        let result = parse_timestamp("yesterday", "messages", "timestamp");
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
