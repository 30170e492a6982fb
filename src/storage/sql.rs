// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL time-series backend (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Measurements are stored in long format, one row per field:
//! ```sql
//! CREATE TABLE measurements (
//!   stream_id  VARCHAR(255) NOT NULL,
//!   ts_micros  BIGINT NOT NULL,        -- microseconds since epoch, UTC
//!   field      VARCHAR(255) NOT NULL,
//!   value      DOUBLE NOT NULL,
//!   PRIMARY KEY (stream_id, ts_micros, field)
//! )
//! ```
//!
//! The primary key is the upsert key, so re-ingesting an overlapping range
//! replaces values instead of duplicating rows. The last timestamp of a
//! stream is `MAX(ts_micros)` and is served by the primary key index.
//!
//! Device descriptors live in a second table, `catalog_documents`, keyed by
//! `(collection, doc_key)` with the JSON document stored as text.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL `VARCHAR`/`LONGTEXT` columns may come back as bytes through the
//! `Any` driver, so text columns are read as `String` first and as
//! `Vec<u8>` second.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{MetadataCatalog, StoreError, TimeSeriesStore};
use crate::record::Record;
use crate::resilience::retry::{retry, RetryPolicy};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

// 4 binds per row keeps a chunk well under SQLite's parameter limit
const CHUNK_SIZE: usize = 200;

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and
    /// create the tables if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryPolicy::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(backend = if is_sqlite { "sqlite" } else { "mysql" }, "SQL store ready");
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS measurements (
                    stream_id TEXT NOT NULL,
                    ts_micros INTEGER NOT NULL,
                    field TEXT NOT NULL,
                    value REAL NOT NULL,
                    PRIMARY KEY (stream_id, ts_micros, field)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS catalog_documents (
                    collection TEXT NOT NULL,
                    doc_key TEXT NOT NULL,
                    document TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (collection, doc_key)
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS measurements (
                    stream_id VARCHAR(255) NOT NULL,
                    ts_micros BIGINT NOT NULL,
                    field VARCHAR(255) NOT NULL,
                    value DOUBLE NOT NULL,
                    PRIMARY KEY (stream_id, ts_micros, field)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS catalog_documents (
                    collection VARCHAR(128) NOT NULL,
                    doc_key VARCHAR(255) NOT NULL,
                    document LONGTEXT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (collection, doc_key)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryPolicy::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn upsert_sql(&self, rows: usize) -> String {
        let placeholders = vec!["(?, ?, ?, ?)"; rows].join(", ");
        if self.is_sqlite {
            format!(
                "INSERT INTO measurements (stream_id, ts_micros, field, value) VALUES {} \
                 ON CONFLICT(stream_id, ts_micros, field) DO UPDATE SET value = excluded.value",
                placeholders
            )
        } else {
            format!(
                "INSERT INTO measurements (stream_id, ts_micros, field, value) VALUES {} \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)",
                placeholders
            )
        }
    }

    /// Number of measurement rows (one per field) for a stream.
    pub async fn count_rows(&self, stream_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM measurements WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let count: i64 = row.try_get("cnt").map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}

/// Read a text column, falling back to bytes for MySQL through `Any`.
fn text_column(row: &AnyRow, column: &str) -> Result<String, StoreError> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| StoreError::Serialization(format!("column '{}' is not text", column)))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", micros)))
}

#[async_trait]
impl TimeSeriesStore for SqlStore {
    async fn query_last_timestamp(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MAX(ts_micros) as last_ts FROM measurements WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let last: Option<i64> = row
            .try_get("last_ts")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        last.map(from_micros).transpose()
    }

    async fn write_upsert(&self, stream_id: &str, records: &[Record]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        // SQLite turns NaN into NULL, which the NOT NULL value column rejects
        let rows: Vec<(i64, &str, f64)> = records
            .iter()
            .flat_map(|r| {
                let ts = r.timestamp.timestamp_micros();
                r.fields
                    .iter()
                    .filter(|(_, value)| value.is_finite())
                    .map(move |(field, value)| (ts, field.as_str(), *value))
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        let stored = records
            .iter()
            .filter(|r| r.fields.values().any(|v| v.is_finite()))
            .count();

        // One transaction per call: a window is stored completely or not at all
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for chunk in rows.chunks(CHUNK_SIZE) {
            let sql = self.upsert_sql(chunk.len());
            let mut query = sqlx::query(&sql);
            for (ts, field, value) in chunk {
                query = query.bind(stream_id).bind(*ts).bind(*field).bind(*value);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(stream_id, records = stored, rows = rows.len(), "Upserted measurements");
        Ok(stored)
    }

    async fn read_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT ts_micros, field, value FROM measurements \
             WHERE stream_id = ? AND ts_micros >= ? AND ts_micros < ? \
             ORDER BY ts_micros",
        )
        .bind(stream_id)
        .bind(from.timestamp_micros())
        .bind(to.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut grouped: BTreeMap<i64, BTreeMap<String, f64>> = BTreeMap::new();
        for row in rows {
            let ts: i64 = row.try_get("ts_micros").map_err(|e| StoreError::Backend(e.to_string()))?;
            let field = text_column(&row, "field")?;
            let value: f64 = row.try_get("value").map_err(|e| StoreError::Backend(e.to_string()))?;
            grouped.entry(ts).or_default().insert(field, value);
        }

        grouped
            .into_iter()
            .map(|(ts, fields)| Ok(Record { timestamp: from_micros(ts)?, fields }))
            .collect()
    }

    async fn known_fields(&self, stream_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT field FROM measurements WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(|row| text_column(row, "field")).collect()
    }
}

#[async_trait]
impl MetadataCatalog for SqlStore {
    async fn upsert(&self, collection: &str, key: &str, document: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(document)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().timestamp_millis();

        let sql = if self.is_sqlite {
            "INSERT INTO catalog_documents (collection, doc_key, document, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(collection, doc_key) DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO catalog_documents (collection, doc_key, document, updated_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE document = VALUES(document), updated_at = VALUES(updated_at)"
        };

        sqlx::query(sql)
            .bind(collection)
            .bind(key)
            .bind(body)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT document FROM catalog_documents WHERE collection = ? AND doc_key = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let body = text_column(&row, "document")?;
                let doc = serde_json::from_str(&body)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }
}
