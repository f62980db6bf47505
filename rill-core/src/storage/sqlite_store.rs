use super::{Record, VersionStore};
use crate::{Result, RillError};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

/// Durable record storage in a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn read_record(&self, name: &str) -> Result<Option<Record>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT version, data FROM records WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((version, data)) = row else {
            return Ok(None);
        };

        Ok(Some(Record {
            version: version as u64,
            data: serde_json::from_str(&data)?,
        }))
    }

    fn write_record(&self, name: &str, record: &Record) -> Result<()> {
        let conn = self.get_conn()?;
        let data = serde_json::to_string(&record.data)?;
        conn.execute(
            "INSERT INTO records (name, version, data, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![name, record.version as i64, data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl VersionStore for SqliteStorage {
    async fn get(&self, name: &str) -> Result<Option<Record>> {
        let store = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || store.read_record(&name))
            .await
            .map_err(|error| RillError::Storage(format!("storage read task failed: {}", error)))?
    }

    async fn set(&self, name: &str, record: &Record) -> Result<()> {
        let store = self.clone();
        let name = name.to_string();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.write_record(&name, &record))
            .await
            .map_err(|error| RillError::Storage(format!("storage write task failed: {}", error)))?
    }
}
