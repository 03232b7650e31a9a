use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kvmigrate_core::StoreError;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;

const LATEST_LAYOUT_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const LAYOUT_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_buckets (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_objects (
  bucket TEXT NOT NULL REFERENCES kv_buckets(name) ON DELETE CASCADE,
  key TEXT NOT NULL,
  value_json TEXT NOT NULL CHECK (json_valid(value_json)),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (bucket, key)
);
";

/// Key-value store on a single `SQLite` file.
///
/// The physical table layout is versioned separately from the data model it holds: the
/// `schema_migrations` table tracks the layout, the `version` bucket tracks the data.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl LayoutStatus {
    /// Status of a database file that has not been created yet.
    #[must_use]
    pub fn unapplied() -> Self {
        Self {
            current_version: 0,
            target_version: LATEST_LAYOUT_VERSION,
            pending_versions: (1..=LATEST_LAYOUT_VERSION).collect(),
        }
    }
}

impl SqliteStore {
    /// Open a store, configure runtime pragmas and bring the table layout up to date.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be applied, or
    /// the layout cannot be migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let store = Self { conn };
        store.migrate_layout()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error when layout metadata cannot be read.
    pub fn layout_status(&self) -> Result<LayoutStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_layout_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_LAYOUT_VERSION {
            ((current_version + 1)..=LATEST_LAYOUT_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(LayoutStatus {
            current_version,
            target_version: LATEST_LAYOUT_VERSION,
            pending_versions,
        })
    }

    /// Apply every pending layout migration.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the file was written by a newer build.
    pub fn migrate_layout(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_layout_version(&self.conn)?;
        if version > LATEST_LAYOUT_VERSION {
            return Err(anyhow!(
                "unsupported layout version {version}; expected at most {LATEST_LAYOUT_VERSION}"
            ));
        }

        if version < 1 {
            apply_layout_1(&self.conn)?;
            info!(layout_version = 1, "applied sqlite layout migration");
        }

        Ok(())
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

impl kvmigrate_core::Connection for SqliteStore {
    fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let now = now_rfc3339().map_err(StoreError::backend)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO kv_buckets(name, created_at) VALUES (?1, ?2)",
                params![bucket, now],
            )
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT value_json FROM kv_objects WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::backend)?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(|err| StoreError::encoding(bucket, key, err)))
            .transpose()
    }

    fn update_object(&self, bucket: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let value_json =
            serde_json::to_string(value).map_err(|err| StoreError::encoding(bucket, key, err))?;
        self.ensure_bucket(bucket)?;
        let now = now_rfc3339().map_err(StoreError::backend)?;
        self.conn
            .execute(
                "INSERT INTO kv_objects(bucket, key, value_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(bucket, key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![bucket, key, value_json, now],
            )
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv_objects WHERE bucket = ?1 AND key = ?2", params![bucket, key])
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn list_keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv_objects WHERE bucket = ?1 ORDER BY key")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![bucket], |row| row.get::<_, String>(0))
            .map_err(StoreError::backend)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(StoreError::backend)?);
        }
        Ok(keys)
    }
}

fn apply_layout_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(LAYOUT_001_SQL).context("failed to apply layout migration v1")?;
    record_layout_version(conn, 1)?;
    Ok(())
}

fn current_layout_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current layout version")?;
    Ok(version)
}

fn record_layout_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339().context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record layout version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, time::error::Format> {
    OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)
}
