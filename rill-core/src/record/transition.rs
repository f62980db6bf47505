//! Serialized application of queued updates and patches to one record.
//!
//! A transition runs as its own task. Client steps arrive on a command channel;
//! record loads and backend writes run as spawned tasks whose completions come
//! back on an event channel, in whatever order the backends finish.

use super::{TargetVersion, UpdateStep, json_path};
use crate::config::StorageExclusion;
use crate::connection::{Connection, ConnectionId, OutboundMessage};
use crate::storage::{Record, VersionStore};
use crate::{Result, RillError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// What a transition needs from whoever owns the name -> transition mapping.
pub trait RecordCoordinator: Send + Sync {
    /// Called when the transition for `name` has nothing left to do.
    ///
    /// Returns `false` if steps were routed to the transition before the
    /// mapping could be removed; the transition then keeps running.
    fn transition_complete(&self, name: &str) -> bool;

    fn broadcast_update(
        &self,
        name: &str,
        step: &UpdateStep,
        is_remote: bool,
        exclude: &ConnectionId,
    );
}

#[derive(Clone)]
pub(crate) struct TransitionContext {
    pub cache: Arc<dyn VersionStore>,
    pub storage: Arc<dyn VersionStore>,
    pub storage_exclusion: StorageExclusion,
    pub coordinator: Arc<dyn RecordCoordinator>,
}

pub(crate) enum TransitionCommand {
    Add {
        sender: Arc<dyn Connection>,
        step: UpdateStep,
        upsert: bool,
    },
}

#[derive(Debug, Default)]
struct TransitionCounters {
    queued: AtomicUsize,
    pending_cache_writes: AtomicUsize,
    pending_storage_writes: AtomicUsize,
}

/// Sending side of a running transition, held by the coordinator.
pub struct TransitionHandle {
    commands: mpsc::UnboundedSender<TransitionCommand>,
    counters: Arc<TransitionCounters>,
}

impl TransitionHandle {
    pub(crate) fn spawn(name: String, context: TransitionContext) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(TransitionCounters::default());

        let transition = RecordTransition::new(name, context, counters.clone(), events_tx);
        tokio::spawn(transition.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            counters,
        }
    }

    /// Queues a command; hands it back if the transition task is gone.
    pub(crate) fn enqueue(
        &self,
        command: TransitionCommand,
    ) -> std::result::Result<(), TransitionCommand> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        self.commands.send(command).map_err(|error| {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            error.0
        })
    }

    /// Commands sent but not yet picked up by the transition.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Outstanding `(cache, storage)` writes.
    pub fn pending_writes(&self) -> (usize, usize) {
        (
            self.counters.pending_cache_writes.load(Ordering::SeqCst),
            self.counters.pending_storage_writes.load(Ordering::SeqCst),
        )
    }
}

enum TransitionEvent {
    Loaded(Result<Option<Record>>),
    CacheWritten {
        result: Result<()>,
        ack: Option<WriteAckTarget>,
    },
    StorageWritten {
        result: Result<()>,
        ack: Option<WriteAckTarget>,
    },
}

#[derive(Clone)]
struct WriteAckTarget {
    sender: Arc<dyn Connection>,
    correlation_id: String,
}

struct QueuedStep {
    sender: Arc<dyn Connection>,
    step: UpdateStep,
}

struct PendingAcks {
    sender: Arc<dyn Connection>,
    counts: HashMap<String, usize>,
}

struct RecordTransition {
    name: String,
    context: TransitionContext,
    counters: Arc<TransitionCounters>,
    events: mpsc::UnboundedSender<TransitionEvent>,
    steps: VecDeque<QueuedStep>,
    current_step: Option<QueuedStep>,
    record: Option<Record>,
    record_request_made: bool,
    loading: bool,
    upsert: bool,
    last_version: Option<u64>,
    existing_versions: Vec<QueuedStep>,
    write_acks: HashMap<ConnectionId, PendingAcks>,
    pending_cache_writes: usize,
    pending_storage_writes: usize,
    failed: bool,
    deferred: Vec<(Arc<dyn Connection>, UpdateStep, bool)>,
}

impl RecordTransition {
    fn new(
        name: String,
        context: TransitionContext,
        counters: Arc<TransitionCounters>,
        events: mpsc::UnboundedSender<TransitionEvent>,
    ) -> Self {
        Self {
            name,
            context,
            counters,
            events,
            steps: VecDeque::new(),
            current_step: None,
            record: None,
            record_request_made: false,
            loading: false,
            upsert: false,
            last_version: None,
            existing_versions: Vec::new(),
            write_acks: HashMap::new(),
            pending_cache_writes: 0,
            pending_storage_writes: 0,
            failed: false,
            deferred: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<TransitionCommand>,
        mut events: mpsc::UnboundedReceiver<TransitionEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.on_event(event),
                Some(command) = commands.recv() => {
                    self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                    match command {
                        TransitionCommand::Add { sender, step, upsert } => {
                            self.add(sender, step, upsert)
                        }
                    }
                }
                else => break,
            }

            if !self.writes_settled() {
                continue;
            }

            if self.failed && !self.deferred.is_empty() {
                self.restart();
            }

            if self.writes_settled()
                && self.is_drained()
                && self.context.coordinator.transition_complete(&self.name)
            {
                break;
            }
        }

        tracing::debug!(record = %self.name, "record transition complete");
    }

    fn writes_settled(&self) -> bool {
        !self.loading && self.pending_cache_writes == 0 && self.pending_storage_writes == 0
    }

    fn is_drained(&self) -> bool {
        self.failed
            || (self.current_step.is_none()
                && self.steps.is_empty()
                && self.existing_versions.is_empty())
    }

    /// Adds an update or patch. The first call loads the record; later calls
    /// start processing straight away if nothing else is queued.
    fn add(&mut self, sender: Arc<dyn Connection>, step: UpdateStep, upsert: bool) {
        if self.failed {
            self.deferred.push((sender, step, upsert));
            return;
        }

        if let Err(error) = step.validate() {
            tracing::debug!(record = %self.name, "rejecting step from {}: {}", sender.user(), error);
            sender.send(OutboundMessage::InvalidMessageData {
                name: self.name.clone(),
                original_action: step.action(),
            });
            return;
        }

        if let TargetVersion::Exact(version) = step.version {
            if self.has_version(version) {
                self.send_version_exists(QueuedStep { sender, step });
                return;
            }
            self.last_version = Some(version);
        }

        self.steps.push_back(QueuedStep { sender, step });

        if !self.record_request_made {
            self.record_request_made = true;
            self.upsert = upsert;
            self.request_record();
        } else if self.steps.len() == 1 && self.current_step.is_none() {
            self.next();
        }
    }

    /// Whether `version` was already applied or queued.
    fn has_version(&self, version: u64) -> bool {
        let loaded = self.record.as_ref().map(|record| record.version);
        match self.last_version.max(loaded) {
            Some(highest) => version <= highest,
            None => false,
        }
    }

    fn request_record(&mut self) {
        self.loading = true;
        let cache = self.context.cache.clone();
        let storage = (!self.context.storage_exclusion.is_excluded(&self.name))
            .then(|| self.context.storage.clone());
        let name = self.name.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = load_record(cache.as_ref(), storage.as_deref(), &name).await;
            let _ = events.send(TransitionEvent::Loaded(result));
        });
    }

    fn on_event(&mut self, event: TransitionEvent) {
        match event {
            TransitionEvent::Loaded(result) => self.on_record(result),
            TransitionEvent::CacheWritten { result, ack } => self.on_cache_response(result, ack),
            TransitionEvent::StorageWritten { result, ack } => {
                self.on_storage_response(result, ack)
            }
        }
    }

    fn on_record(&mut self, result: Result<Option<Record>>) {
        self.loading = false;
        let record = match result {
            Ok(Some(record)) => record,
            Ok(None) if self.upsert => Record::baseline(),
            Ok(None) => {
                self.on_fatal_error(RillError::RecordNotFound(self.name.clone()));
                return;
            }
            Err(error) => {
                self.on_fatal_error(error);
                return;
            }
        };

        self.record = Some(record);
        self.flush_version_exists();
        self.next();
    }

    /// Applies queued steps until one is written or the queue runs dry.
    fn next(&mut self) {
        if self.failed || self.current_step.is_some() {
            return;
        }

        while let Some(mut queued) = self.steps.pop_front() {
            let Some(current_version) = self.record.as_ref().map(|record| record.version) else {
                self.steps.push_front(queued);
                return;
            };

            let version = match queued.step.version {
                TargetVersion::Any => current_version + 1,
                TargetVersion::Exact(version) => version,
            };
            queued.step.version = TargetVersion::Exact(version);

            if version != current_version + 1 {
                self.send_version_exists(queued);
                continue;
            }

            if let Err(error) = self.apply(&queued.step, version) {
                tracing::debug!(record = %self.name, "could not apply step: {}", error);
                queued.sender.send(OutboundMessage::InvalidMessageData {
                    name: self.name.clone(),
                    original_action: queued.step.action(),
                });
                continue;
            }

            self.last_version = self.last_version.max(Some(version));
            self.write(queued);
            return;
        }
    }

    fn apply(&mut self, step: &UpdateStep, version: u64) -> Result<()> {
        let record = self
            .record
            .as_mut()
            .ok_or_else(|| RillError::Internal("record not loaded".to_string()))?;

        match &step.path {
            Some(path) => {
                let mut data = record.data.clone();
                json_path::set_value(&mut data, path, step.data.clone())?;
                record.data = data;
            }
            None => record.data = step.data.clone(),
        }
        record.version = version;
        Ok(())
    }

    /// Issues the storage write, then the cache write, for the record as it
    /// stands after `queued` was applied. Only the cache completion moves the
    /// queue forward.
    fn write(&mut self, queued: QueuedStep) {
        let Some(record) = self.record.clone() else {
            return;
        };
        let ack = queued.step.is_write_ack.then(|| WriteAckTarget {
            sender: queued.sender.clone(),
            correlation_id: queued.step.correlation_id.clone().unwrap_or_default(),
        });

        if !self.context.storage_exclusion.is_excluded(&self.name) {
            self.pending_storage_writes += 1;
            self.counters
                .pending_storage_writes
                .fetch_add(1, Ordering::SeqCst);
            if let Some(ack) = &ack {
                self.set_up_write_acknowledgement(ack);
            }

            let storage = self.context.storage.clone();
            let name = self.name.clone();
            let record = record.clone();
            let events = self.events.clone();
            let ack = ack.clone();
            tokio::spawn(async move {
                let result = storage.set(&name, &record).await;
                let _ = events.send(TransitionEvent::StorageWritten { result, ack });
            });
        }

        self.pending_cache_writes += 1;
        self.counters
            .pending_cache_writes
            .fetch_add(1, Ordering::SeqCst);
        if let Some(ack) = &ack {
            self.set_up_write_acknowledgement(ack);
        }

        let cache = self.context.cache.clone();
        let name = self.name.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = cache.set(&name, &record).await;
            let _ = events.send(TransitionEvent::CacheWritten { result, ack });
        });

        self.current_step = Some(queued);
    }

    fn on_cache_response(&mut self, result: Result<()>, ack: Option<WriteAckTarget>) {
        self.pending_cache_writes -= 1;
        self.counters
            .pending_cache_writes
            .fetch_sub(1, Ordering::SeqCst);

        if let Err(error) = result {
            self.on_fatal_error(error);
            return;
        }
        if let Some(ack) = ack {
            self.handle_write_acknowledgement(&ack);
        }
        if self.failed {
            return;
        }

        if let Some(current) = self.current_step.take() {
            let step = current.step.without_write_ack();
            self.context.coordinator.broadcast_update(
                &self.name,
                &step,
                current.sender.is_remote(),
                current.sender.id(),
            );
        }
        self.next();
    }

    fn on_storage_response(&mut self, result: Result<()>, ack: Option<WriteAckTarget>) {
        self.pending_storage_writes -= 1;
        self.counters
            .pending_storage_writes
            .fetch_sub(1, Ordering::SeqCst);

        if let Err(error) = result {
            self.on_fatal_error(error);
            return;
        }
        if let Some(ack) = ack {
            self.handle_write_acknowledgement(&ack);
        }
    }

    fn set_up_write_acknowledgement(&mut self, ack: &WriteAckTarget) {
        let pending = self
            .write_acks
            .entry(ack.sender.id().clone())
            .or_insert_with(|| PendingAcks {
                sender: ack.sender.clone(),
                counts: HashMap::new(),
            });
        *pending.counts.entry(ack.correlation_id.clone()).or_insert(0) += 1;
    }

    fn handle_write_acknowledgement(&mut self, ack: &WriteAckTarget) {
        let sender_id = ack.sender.id();
        let Some(pending) = self.write_acks.get_mut(sender_id) else {
            if self.failed {
                tracing::debug!(record = %self.name, "write ack for {} after failure", sender_id);
            } else {
                tracing::warn!(record = %self.name, "unknown write ack target {}", sender_id);
            }
            return;
        };

        let Some(count) = pending.counts.get_mut(&ack.correlation_id) else {
            tracing::warn!(
                record = %self.name,
                "unknown write ack correlation id {} for {}",
                ack.correlation_id,
                sender_id
            );
            return;
        };

        *count -= 1;
        if *count == 0 {
            pending.counts.remove(&ack.correlation_id);
            pending.sender.send(OutboundMessage::WriteAcknowledgement {
                name: self.name.clone(),
                correlation_id: ack.correlation_id.clone(),
            });
        }
        if pending.counts.is_empty() {
            self.write_acks.remove(sender_id);
        }
    }

    fn send_version_exists(&mut self, queued: QueuedStep) {
        let Some(record) = &self.record else {
            self.existing_versions.push(queued);
            return;
        };

        tracing::warn!(
            record = %self.name,
            "{} tried to update record to version {} but it already was {}",
            queued.sender.user(),
            queued.step.version,
            record.version
        );
        queued.sender.send(OutboundMessage::VersionExists {
            name: self.name.clone(),
            version: record.version,
            data: record.data.clone(),
            original_action: queued.step.action(),
        });
    }

    fn flush_version_exists(&mut self) {
        for queued in std::mem::take(&mut self.existing_versions) {
            self.send_version_exists(queued);
        }
    }

    /// Aborts the queue. Queued senders and anyone still owed a write
    /// acknowledgement are told the update failed.
    fn on_fatal_error(&mut self, error: RillError) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::error!(record = %self.name, "record update error: {}", error);

        let reason = error.to_string();
        let unanswered = self
            .steps
            .drain(..)
            .chain(self.existing_versions.drain(..))
            .filter(|queued| !queued.sender.is_remote());
        for queued in unanswered {
            queued.sender.send(OutboundMessage::RecordUpdateError {
                name: self.name.clone(),
                correlation_id: None,
                reason: Some(reason.clone()),
            });
        }

        for (_, pending) in self.write_acks.drain() {
            for correlation_id in pending.counts.into_keys() {
                pending.sender.send(OutboundMessage::RecordUpdateError {
                    name: self.name.clone(),
                    correlation_id: Some(correlation_id),
                    reason: Some(reason.clone()),
                });
            }
        }

        self.current_step = None;
    }

    /// Steps that arrived while a failed transition drained its writes start
    /// over against a freshly loaded record.
    fn restart(&mut self) {
        tracing::debug!(record = %self.name, "restarting record transition");
        self.failed = false;
        self.record = None;
        self.record_request_made = false;
        self.upsert = false;
        self.last_version = None;

        for (sender, step, upsert) in std::mem::take(&mut self.deferred) {
            self.add(sender, step, upsert);
        }
    }
}

/// Reads a record from the cache, falling back to storage on a miss.
pub(crate) async fn load_record(
    cache: &dyn VersionStore,
    storage: Option<&dyn VersionStore>,
    name: &str,
) -> Result<Option<Record>> {
    if let Some(record) = cache.get(name).await? {
        return Ok(Some(record));
    }
    match storage {
        Some(storage) => storage.get(name).await,
        None => Ok(None),
    }
}
