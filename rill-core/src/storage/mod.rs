//! Version stores for Rill
//!
//! A record is persisted to two independent stores: a fast cache and a durable
//! storage. Both satisfy [`VersionStore`].

pub mod memory_store;
pub mod redis_cache;
pub mod sqlite_store;

pub use memory_store::MemoryStore;
pub use redis_cache::RedisCache;
pub use sqlite_store::SqliteStorage;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, versioned value. Version 0 means the record does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub version: u64,
    pub data: Value,
}

impl Record {
    pub fn new(version: u64, data: Value) -> Self {
        Self { version, data }
    }

    /// Baseline used when an upsert targets a record that does not exist.
    pub fn baseline() -> Self {
        Self {
            version: 0,
            data: Value::Object(Default::default()),
        }
    }
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Record>>;

    async fn set(&self, name: &str, record: &Record) -> Result<()>;
}
