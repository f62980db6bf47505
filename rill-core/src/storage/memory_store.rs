use super::{Record, VersionStore};
use crate::{Result, RillError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-process version store.
///
/// Failures and write latency can be injected, which lets callers observe
/// cache and storage completions arriving in either order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    records: HashMap<String, Record>,
    fail_reads: bool,
    fail_writes: bool,
    write_delay: Option<Duration>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, name: impl Into<String>, record: Record) {
        self.lock().records.insert(name.into(), record);
    }

    pub fn snapshot(&self, name: &str) -> Option<Record> {
        self.lock().records.get(name).cloned()
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.lock().write_delay = delay;
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Record>> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(RillError::Internal(format!("injected read failure for {}", name)));
        }
        Ok(inner.records.get(name).cloned())
    }

    async fn set(&self, name: &str, record: &Record) -> Result<()> {
        let delay = self.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(RillError::Internal(format!("injected write failure for {}", name)));
        }
        inner.records.insert(name.to_string(), record.clone());
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("a", &Record::new(1, json!({"x": 1}))).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().version, 1);
        assert_eq!(store.writes(), 1);

        store.set_fail_writes(true);
        assert!(store.set("a", &Record::new(2, json!({}))).await.is_err());
        assert_eq!(store.snapshot("a").unwrap().version, 1);

        store.set_fail_reads(true);
        assert!(store.get("a").await.is_err());
    }

    #[test]
    fn test_injected_failures_reset() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(tokio_test::block_on(store.set("a", &Record::baseline())).is_err());

        store.set_fail_writes(false);
        tokio_test::block_on(store.set("a", &Record::baseline())).unwrap();
        assert_eq!(store.snapshot("a"), Some(Record::baseline()));
    }
}
