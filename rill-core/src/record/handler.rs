use super::UpdateStep;
use super::transition::{
    RecordCoordinator, TransitionCommand, TransitionContext, TransitionHandle, load_record,
};
use crate::config::{RecordConfig, StorageExclusion};
use crate::connection::{Connection, ConnectionId};
use crate::storage::{Record, VersionStore};
use crate::{Result, RillError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Fans accepted updates out to the subscribers of a record.
pub trait SubscriptionBroadcaster: Send + Sync {
    fn broadcast(&self, name: &str, step: &UpdateStep, is_remote: bool, exclude: &ConnectionId);
}

/// Routes writes to the single active transition of each record name.
pub struct RecordHandler {
    me: Weak<RecordHandler>,
    cache: Arc<dyn VersionStore>,
    storage: Arc<dyn VersionStore>,
    storage_exclusion: StorageExclusion,
    broadcaster: Arc<dyn SubscriptionBroadcaster>,
    transitions: Mutex<HashMap<String, TransitionHandle>>,
}

impl RecordHandler {
    pub fn new(
        config: &RecordConfig,
        cache: Arc<dyn VersionStore>,
        storage: Arc<dyn VersionStore>,
        broadcaster: Arc<dyn SubscriptionBroadcaster>,
    ) -> Result<Arc<Self>> {
        let storage_exclusion = config.storage_exclusion()?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cache,
            storage,
            storage_exclusion,
            broadcaster,
            transitions: Mutex::new(HashMap::new()),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TransitionHandle>> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> Result<TransitionContext> {
        let coordinator: Arc<dyn RecordCoordinator> = self
            .me
            .upgrade()
            .ok_or_else(|| RillError::Internal("record handler is shutting down".to_string()))?;

        Ok(TransitionContext {
            cache: self.cache.clone(),
            storage: self.storage.clone(),
            storage_exclusion: self.storage_exclusion.clone(),
            coordinator,
        })
    }

    /// Queues an update or patch behind every earlier write to the same record.
    ///
    /// With `upsert` a missing record is created from an empty baseline instead
    /// of failing the write.
    pub fn handle_update(
        &self,
        sender: Arc<dyn Connection>,
        step: UpdateStep,
        upsert: bool,
    ) -> Result<()> {
        let name = step.name.clone();
        let command = TransitionCommand::Add {
            sender,
            step,
            upsert,
        };

        let mut transitions = self.lock();
        let command = match transitions.get(&name) {
            Some(handle) => match handle.enqueue(command) {
                Ok(()) => return Ok(()),
                Err(command) => {
                    tracing::warn!(record = %name, "record transition task is gone; starting a new one");
                    transitions.remove(&name);
                    command
                }
            },
            None => command,
        };

        let handle = TransitionHandle::spawn(name.clone(), self.context()?);
        handle.enqueue(command).map_err(|_| {
            RillError::Internal(format!("record transition for {} stopped unexpectedly", name))
        })?;
        transitions.insert(name, handle);
        Ok(())
    }

    /// Current value of a record as seen by the cache, or storage on a miss.
    pub async fn get_record(&self, name: &str) -> Result<Option<Record>> {
        let storage = (!self.storage_exclusion.is_excluded(name)).then_some(self.storage.as_ref());
        load_record(self.cache.as_ref(), storage, name).await
    }

    pub fn has_transition(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn active_transitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Outstanding `(cache, storage)` writes of the active transition for `name`.
    pub fn pending_writes(&self, name: &str) -> Option<(usize, usize)> {
        self.lock().get(name).map(TransitionHandle::pending_writes)
    }
}

impl RecordCoordinator for RecordHandler {
    fn transition_complete(&self, name: &str) -> bool {
        let mut transitions = self.lock();
        match transitions.get(name) {
            Some(handle) if handle.queued() > 0 => false,
            Some(_) => {
                transitions.remove(name);
                true
            }
            None => true,
        }
    }

    fn broadcast_update(
        &self,
        name: &str,
        step: &UpdateStep,
        is_remote: bool,
        exclude: &ConnectionId,
    ) {
        self.broadcaster.broadcast(name, step, is_remote, exclude);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingBroadcaster;
    use super::*;
    use crate::connection::testing::RecordingConnection;
    use crate::record::TargetVersion;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_transition_removed_after_drain() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        let handler = RecordHandler::new(
            &RecordConfig::default(),
            cache.clone(),
            storage.clone(),
            Arc::new(RecordingBroadcaster::default()),
        )
        .unwrap();
        let conn = RecordingConnection::new("alice");

        handler
            .handle_update(
                conn.clone(),
                UpdateStep::update("users/alice", TargetVersion::Any, json!({"a": 1})),
                true,
            )
            .unwrap();
        assert!(handler.has_transition("users/alice"));
        assert_eq!(handler.active_transitions(), vec!["users/alice".to_string()]);

        for _ in 0..1000 {
            if !handler.has_transition("users/alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!handler.has_transition("users/alice"));
        assert_eq!(handler.pending_writes("users/alice"), None);

        let record = handler.get_record("users/alice").await.unwrap().unwrap();
        assert_eq!(record, Record::new(1, json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_get_record_falls_back_to_storage() {
        let cache = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryStore::new());
        storage.insert("users/bob", Record::new(7, json!({"b": true})));
        storage.insert("tmp/session", Record::new(2, json!({})));

        let config = RecordConfig {
            storage_exclusion: Some("^tmp/".to_string()),
        };
        let handler = RecordHandler::new(
            &config,
            cache,
            storage,
            Arc::new(RecordingBroadcaster::default()),
        )
        .unwrap();

        assert_eq!(
            handler.get_record("users/bob").await.unwrap().unwrap().version,
            7
        );
        assert_eq!(handler.get_record("tmp/session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transition_complete_declines_while_commands_queued() {
        let handler = RecordHandler::new(
            &RecordConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingBroadcaster::default()),
        )
        .unwrap();
        let conn = RecordingConnection::new("alice");

        // Nothing has been polled yet, so the command is still queued.
        handler
            .handle_update(
                conn,
                UpdateStep::update("a", TargetVersion::Any, json!({})),
                true,
            )
            .unwrap();
        assert!(!handler.transition_complete("a"));
        assert!(handler.has_transition("a"));
        assert!(handler.transition_complete("unknown"));
    }
}
