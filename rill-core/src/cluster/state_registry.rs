use super::message::{ClusterMessageBus, StateAction, StateMessage};
use crate::config::StateRegistryConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Rolling hash of a name's UTF-16 code units, `h = h * 31 + c` in 32 bits.
pub fn create_checksum(name: &str) -> i32 {
    name.encode_utf16().fold(0i32, |checksum, unit| {
        checksum
            .wrapping_shl(5)
            .wrapping_sub(checksum)
            .wrapping_add(i32::from(unit))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// First holder of a name appeared anywhere in the cluster.
    Add(String),
    /// Last holder of a name went away.
    Remove(String),
    /// Every initially known server has supplied its full state.
    Ready,
    ServerAdded { name: String, node: String },
    ServerRemoved { name: String, node: String },
}

struct Entry {
    local_count: usize,
    nodes: HashSet<String>,
    checksum: i32,
}

enum ChecksumWaiter {
    /// Gossip the local total to the cluster.
    Broadcast,
    /// Compare our view of a remote node with the total it reported.
    Verify(i64),
}

#[derive(Default)]
struct NodeState {
    reconciliation: Option<(u64, JoinHandle<()>)>,
    checksum_waiters: Option<Vec<ChecksumWaiter>>,
    full_state_sent: bool,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Entry>,
    nodes: HashMap<String, NodeState>,
    initial_servers: HashSet<String>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
    ready: bool,
    next_timer_id: u64,
}

impl RegistryState {
    fn emit(&mut self, event: RegistryEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn add_to_server(&mut self, name: &str, node: &str) {
        if !self.entries.contains_key(name) {
            self.entries.insert(
                name.to_string(),
                Entry {
                    local_count: 0,
                    nodes: HashSet::new(),
                    checksum: create_checksum(name),
                },
            );
            self.emit(RegistryEvent::Add(name.to_string()));
        }

        let inserted = self
            .entries
            .get_mut(name)
            .is_some_and(|entry| entry.nodes.insert(node.to_string()));
        if inserted {
            self.emit(RegistryEvent::ServerAdded {
                name: name.to_string(),
                node: node.to_string(),
            });
        }
    }

    fn remove_from_server(&mut self, name: &str, node: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if !entry.nodes.remove(node) {
            return;
        }

        if entry.nodes.is_empty() {
            self.entries.remove(name);
            self.emit(RegistryEvent::Remove(name.to_string()));
        }
        self.emit(RegistryEvent::ServerRemoved {
            name: name.to_string(),
            node: node.to_string(),
        });
    }

    fn names_held_by(&self, node: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.nodes.contains(node))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn checksum_total(&self, node: &str) -> i64 {
        self.entries
            .values()
            .filter(|entry| entry.nodes.contains(node))
            .fold(0i64, |total, entry| {
                total.wrapping_add(i64::from(entry.checksum))
            })
    }

    fn cancel_reconciliation(&mut self, node: &str) {
        if let Some((_, timer)) = self
            .nodes
            .get_mut(node)
            .and_then(|state| state.reconciliation.take())
        {
            timer.abort();
        }
    }
}

struct RegistryInner {
    topic: String,
    server_name: String,
    config: StateRegistryConfig,
    bus: Arc<dyn ClusterMessageBus>,
    state: Mutex<RegistryState>,
    ready: watch::Sender<bool>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn message(&self, action: StateAction) -> StateMessage {
        StateMessage::new(self.topic.clone(), action)
    }

    fn mark_ready(&self, state: &mut RegistryState) {
        if state.ready {
            return;
        }
        state.ready = true;
        tracing::info!(topic = %self.topic, "state registry is ready");
        state.emit(RegistryEvent::Ready);
        self.ready.send_replace(true);
    }

    fn process(self: &Arc<Self>, message: StateMessage, sender: String) {
        if sender == self.server_name || message.registry_topic != self.topic {
            return;
        }

        let mut state = self.lock();
        match (message.action, message.name, message.checksum, message.full_state) {
            (StateAction::Add, Some(name), _, _) => state.add_to_server(&name, &sender),
            (StateAction::Remove, Some(name), _, _) => state.remove_from_server(&name, &sender),
            (StateAction::Checksum, _, Some(checksum), _) => {
                self.request_checksum_total(&mut state, &sender, ChecksumWaiter::Verify(checksum))
            }
            (StateAction::RequestFullState, _, _, _) => self.send_full_state(&mut state, &sender),
            (StateAction::FullState, _, _, Some(full_state)) => {
                self.apply_full_state(&mut state, &sender, &full_state)
            }
            (action, ..) => {
                tracing::warn!(
                    topic = %self.topic,
                    from = %sender,
                    ?action,
                    "ignoring state message with missing payload"
                );
            }
        }
    }

    /// Coalesces total-checksum requests for `node` over the aggregation window.
    fn request_checksum_total(
        self: &Arc<Self>,
        state: &mut RegistryState,
        node: &str,
        waiter: ChecksumWaiter,
    ) {
        let node_state = state.nodes.entry(node.to_string()).or_default();
        if let Some(waiters) = node_state.checksum_waiters.as_mut() {
            waiters.push(waiter);
            return;
        }
        node_state.checksum_waiters = Some(vec![waiter]);

        let registry = Arc::downgrade(self);
        let node = node.to_string();
        let window = self.config.check_sum_buffer();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(registry) = registry.upgrade() {
                registry.flush_checksum_waiters(&node);
            }
        });
    }

    fn flush_checksum_waiters(self: &Arc<Self>, node: &str) {
        let mut state = self.lock();
        let waiters = state
            .nodes
            .get_mut(node)
            .and_then(|node_state| node_state.checksum_waiters.take())
            .unwrap_or_default();
        let total = state.checksum_total(node);

        let mut broadcast = false;
        for waiter in waiters {
            match waiter {
                ChecksumWaiter::Broadcast => broadcast = true,
                ChecksumWaiter::Verify(remote) => {
                    self.verify_checksum(&mut state, node, remote, total)
                }
            }
        }
        // One gossip per window, however many local changes it covered.
        if broadcast {
            self.bus
                .send_state(self.message(StateAction::Checksum).with_checksum(total));
        }
    }

    fn verify_checksum(
        self: &Arc<Self>,
        state: &mut RegistryState,
        node: &str,
        remote: i64,
        local: i64,
    ) {
        if remote == local {
            state.cancel_reconciliation(node);
            return;
        }

        let node_state = state.nodes.entry(node.to_string()).or_default();
        if node_state.reconciliation.is_some() {
            return;
        }

        tracing::debug!(
            topic = %self.topic,
            node,
            remote,
            local,
            "checksum mismatch, scheduling reconciliation"
        );
        state.next_timer_id += 1;
        let timer_id = state.next_timer_id;
        let registry = Arc::downgrade(self);
        let target = node.to_string();
        let delay = self.config.state_reconciliation_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.on_reconciliation_timeout(&target, timer_id);
            }
        });

        if let Some(node_state) = state.nodes.get_mut(node) {
            node_state.reconciliation = Some((timer_id, timer));
        }
    }

    fn on_reconciliation_timeout(&self, node: &str, timer_id: u64) {
        let mut state = self.lock();
        let Some(node_state) = state.nodes.get_mut(node) else {
            return;
        };
        if !matches!(node_state.reconciliation, Some((id, _)) if id == timer_id) {
            return;
        }
        node_state.reconciliation = None;

        tracing::info!(topic = %self.topic, node, "requesting full state after checksum drift");
        self.bus
            .send_state_direct(node, self.message(StateAction::RequestFullState));
    }

    fn send_full_state(self: &Arc<Self>, state: &mut RegistryState, node: &str) {
        let node_state = state.nodes.entry(node.to_string()).or_default();
        if node_state.full_state_sent {
            tracing::debug!(topic = %self.topic, node, "full state already sent recently");
            return;
        }
        node_state.full_state_sent = true;

        let names = state.names_held_by(&self.server_name);
        self.bus.send_state_direct(
            node,
            self.message(StateAction::FullState).with_full_state(names),
        );

        let registry = Arc::downgrade(self);
        let node = node.to_string();
        let window = self.config.state_reconciliation_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(registry) = registry.upgrade() {
                if let Some(node_state) = registry.lock().nodes.get_mut(&node) {
                    node_state.full_state_sent = false;
                }
            }
        });
    }

    fn apply_full_state(&self, state: &mut RegistryState, node: &str, full_state: &[String]) {
        let incoming: HashSet<&str> = full_state.iter().map(String::as_str).collect();
        let stale: Vec<String> = state
            .names_held_by(node)
            .into_iter()
            .filter(|name| !incoming.contains(name.as_str()))
            .collect();

        for name in &stale {
            state.remove_from_server(name, node);
        }
        for name in full_state {
            state.add_to_server(name, node);
        }

        if state.initial_servers.remove(node) && state.initial_servers.is_empty() {
            self.mark_ready(state);
        }
    }

    fn request_full_state(&self, node: &str) {
        self.bus
            .send_state_direct(node, self.message(StateAction::RequestFullState));
    }
}

/// Per-topic replicated membership: which nodes hold which names.
///
/// Must be created inside a tokio runtime; gossip is processed on a
/// background task that stops when the registry is dropped.
pub struct DistributedStateRegistry {
    inner: Arc<RegistryInner>,
    listener: JoinHandle<()>,
}

impl DistributedStateRegistry {
    pub fn new(
        topic: impl Into<String>,
        server_name: impl Into<String>,
        config: StateRegistryConfig,
        bus: Arc<dyn ClusterMessageBus>,
    ) -> Self {
        let topic = topic.into();
        let mut incoming = bus.subscribe(&topic);
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(RegistryInner {
            topic,
            server_name: server_name.into(),
            config,
            bus,
            state: Mutex::new(RegistryState::default()),
            ready,
        });

        let registry: Weak<RegistryInner> = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            while let Some((message, sender)) = incoming.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.process(message, sender);
            }
        });

        Self { inner, listener }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    /// Registry events in the order they happened, from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn add(&self, name: &str) {
        let inner = &self.inner;
        let mut state = inner.lock();
        let local_count = state.entries.get(name).map_or(0, |entry| entry.local_count);

        if local_count > 0 {
            if let Some(entry) = state.entries.get_mut(name) {
                entry.local_count += 1;
            }
            return;
        }

        state.add_to_server(name, &inner.server_name);
        if let Some(entry) = state.entries.get_mut(name) {
            entry.local_count = 1;
        }
        inner
            .bus
            .send_state(inner.message(StateAction::Add).with_name(name));
        inner.request_checksum_total(&mut state, &inner.server_name, ChecksumWaiter::Broadcast);
    }

    pub fn remove(&self, name: &str) {
        let inner = &self.inner;
        let mut state = inner.lock();
        let Some(entry) = state.entries.get_mut(name) else {
            return;
        };
        if entry.local_count == 0 {
            return;
        }
        entry.local_count -= 1;
        if entry.local_count > 0 {
            return;
        }

        state.remove_from_server(name, &inner.server_name);
        inner
            .bus
            .send_state(inner.message(StateAction::Remove).with_name(name));
        inner.request_checksum_total(&mut state, &inner.server_name, ChecksumWaiter::Broadcast);
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().entries.contains_key(name)
    }

    /// Every known name, or only those held by `node`.
    pub fn get_all(&self, node: Option<&str>) -> Vec<String> {
        let state = self.inner.lock();
        match node {
            Some(node) => state.names_held_by(node),
            None => {
                let mut names: Vec<String> = state.entries.keys().cloned().collect();
                names.sort();
                names
            }
        }
    }

    pub fn get_all_servers(&self, name: &str) -> Vec<String> {
        let state = self.inner.lock();
        let mut nodes: Vec<String> = state
            .entries
            .get(name)
            .map(|entry| entry.nodes.iter().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    pub fn get_all_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.nodes.iter().cloned().collect()))
            .collect()
    }

    /// Declares the cluster membership known at startup and asks each node for
    /// its full state. Ready immediately when there are no other nodes.
    pub fn set_servers<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inner = &self.inner;
        let mut state = inner.lock();
        let peers: Vec<String> = nodes
            .into_iter()
            .map(Into::into)
            .filter(|node| *node != inner.server_name)
            .collect();

        state.initial_servers = peers.iter().cloned().collect();
        if state.initial_servers.is_empty() {
            inner.mark_ready(&mut state);
        }
        drop(state);

        for peer in &peers {
            inner.request_full_state(peer);
        }
    }

    pub fn on_server_added(&self, node: &str) {
        if node == self.inner.server_name {
            return;
        }
        tracing::info!(topic = %self.inner.topic, node, "server joined");
        self.inner.request_full_state(node);
    }

    pub fn on_server_removed(&self, node: &str) {
        let inner = &self.inner;
        if node == inner.server_name {
            return;
        }
        tracing::info!(topic = %inner.topic, node, "server left");

        let mut state = inner.lock();
        for name in state.names_held_by(node) {
            state.remove_from_server(&name, node);
        }
        state.cancel_reconciliation(node);
        state.nodes.remove(node);

        if state.initial_servers.remove(node) && state.initial_servers.is_empty() {
            inner.mark_ready(&mut state);
        }
    }

    /// Sends our held names to `node`, at most once per reconciliation window.
    pub fn send_full_state(&self, node: &str) {
        let mut state = self.inner.lock();
        self.inner.send_full_state(&mut state, node);
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub async fn when_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

impl Drop for DistributedStateRegistry {
    fn drop(&mut self) {
        self.listener.abort();
        let mut state = self.inner.lock();
        for node_state in state.nodes.values_mut() {
            if let Some((_, timer)) = node_state.reconciliation.take() {
                timer.abort();
            }
        }
    }
}
