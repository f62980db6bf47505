use super::{Record, VersionStore};
use crate::{Result, RillError};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Redis-backed cache. Records are stored as JSON under `<namespace>:record:<name>`.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            RillError::Config(format!("redis cache connection config error: {}", error))
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|error| RillError::Cache(format!("redis connection failed: {}", error)))?;

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:record:{}", self.namespace, name)
    }
}

#[async_trait]
impl VersionStore for RedisCache {
    async fn get(&self, name: &str) -> Result<Option<Record>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(self.key(name))
            .await
            .map_err(|error| RillError::Cache(format!("redis GET {} failed: {}", name, error)))?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, name: &str, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(name), payload)
            .await
            .map_err(|error| RillError::Cache(format!("redis SET {} failed: {}", name, error)))?;
        Ok(())
    }
}
