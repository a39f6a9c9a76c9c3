use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::warn;

use crate::error::StorageError;
use crate::storage::DeviceStore;
use crate::types::DeviceRecord;

// A stored first_seen is only replaced while it is still NULL, so it never moves once set.
const UPSERT_DEVICE: &str = r#"
INSERT INTO device_info
    (device_id, device_type, manufacturer, model, firmware_version, first_seen, last_seen, status, meta, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
ON CONFLICT (device_id) DO UPDATE SET
    device_type = EXCLUDED.device_type,
    manufacturer = EXCLUDED.manufacturer,
    model = EXCLUDED.model,
    firmware_version = EXCLUDED.firmware_version,
    first_seen = CASE
        WHEN device_info.first_seen IS NULL THEN EXCLUDED.first_seen
        ELSE device_info.first_seen
    END,
    last_seen = EXCLUDED.last_seen,
    status = EXCLUDED.status,
    meta = EXCLUDED.meta,
    updated_at = NOW()
"#;

const SELECT_DEVICE: &str = r#"
SELECT device_id, device_type, manufacturer, model, firmware_version, first_seen, last_seen, status, meta
FROM device_info
WHERE device_id = $1
"#;

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    device_type: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    firmware_version: Option<String>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    status: Option<String>,
    meta: Json<HashMap<String, Value>>,
}

impl From<DeviceRow> for DeviceRecord {
    fn from(row: DeviceRow) -> Self {
        DeviceRecord {
            id: row.device_id,
            kind: row.device_type,
            vendor: row.manufacturer,
            model: row.model,
            firmware_version: row.firmware_version,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            status: row.status,
            meta: row.meta.0,
        }
    }
}

/// `DeviceStore` backed by the `device_info` table.
#[derive(Clone)]
pub struct PostgresDeviceStore {
    pool: PgPool,
}

impl PostgresDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds a lazily connecting pool, so the service can start before the database is up.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub async fn find(&self, device_id: &str) -> Result<Option<DeviceRecord>, StorageError> {
        let row: Option<DeviceRow> = sqlx::query_as(SELECT_DEVICE)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(DeviceRecord::from))
    }
}

#[async_trait]
impl DeviceStore for PostgresDeviceStore {
    async fn upsert(&self, record: &DeviceRecord) -> Result<(), StorageError> {
        sqlx::query(UPSERT_DEVICE)
            .bind(&record.id)
            .bind(&record.kind)
            .bind(&record.vendor)
            .bind(&record.model)
            .bind(&record.firmware_version)
            .bind(record.first_seen)
            .bind(record.last_seen)
            .bind(&record.status)
            .bind(Json(&record.meta))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                warn!(device_id = %record.id, "device upsert failed: {}", e);
                map_sqlx_error(e)
            })?;

        Ok(())
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StorageError {
    match error {
        sqlx::Error::PoolTimedOut => StorageError::Timeout,
        sqlx::Error::Database(db)
            if db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation() =>
        {
            StorageError::Constraint(db.message().to_string())
        }
        // VARCHAR(255) overflow
        sqlx::Error::Database(db) if db.code().as_deref() == Some("22001") => {
            StorageError::Constraint(db.message().to_string())
        }
        other => StorageError::Database(other),
    }
}
