use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::ids::DeviceId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRow {
    pub id: DeviceId,
    pub hostname: String,
    pub registered_at: String,
}

/// Registry of devices that have synced against this store. Each hostname
/// maps to exactly one device row.
pub struct DeviceRepo {
    db: Database,
}

impl DeviceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Look up the device for a hostname, registering it on first sight.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, hostname: &str) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, hostname, registered_at FROM devices WHERE hostname = ?1",
            )?;
            let mut rows = stmt.query([hostname])?;
            if let Some(row) = rows.next()? {
                return row_to_device(row);
            }

            let id = DeviceId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO devices (id, hostname, registered_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), hostname, now],
            )?;

            Ok(DeviceRow {
                id,
                hostname: hostname.to_string(),
                registered_at: now,
            })
        })
    }

    /// Get a device by ID.
    pub fn get(&self, id: &DeviceId) -> Result<DeviceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, hostname, registered_at FROM devices WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_device(row),
                None => Err(StoreError::NotFound(format!("device {id}"))),
            }
        })
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> Result<DeviceRow, StoreError> {
    Ok(DeviceRow {
        id: DeviceId::from_raw(row_helpers::get::<String>(row, 0, "devices", "id")?),
        hostname: row_helpers::get(row, 1, "devices", "hostname")?,
        registered_at: row_helpers::get(row, 2, "devices", "registered_at")?,
    })
}
