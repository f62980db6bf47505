use super::message::{ClusterMessageBus, StateMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedSender<(StateMessage, String)>;

#[derive(Default)]
struct ClusterInner {
    nodes: HashSet<String>,
    // (node, registry topic) -> inboxes
    inboxes: HashMap<(String, String), Vec<Inbox>>,
    // (from, to) links that drop every message
    cut_links: HashSet<(String, String)>,
}

/// In-process cluster hub. Every connected node gets a [`LocalMessageBus`].
///
/// Links between nodes can be cut to simulate lost messages.
#[derive(Clone, Default)]
pub struct LocalCluster {
    inner: Arc<Mutex<ClusterInner>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, node: impl Into<String>) -> LocalMessageBus {
        let node = node.into();
        self.lock().nodes.insert(node.clone());
        LocalMessageBus {
            node,
            cluster: self.clone(),
        }
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.lock().nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Drops (`up == false`) or restores delivery from `from` to `to`.
    pub fn set_link(&self, from: &str, to: &str, up: bool) {
        let link = (from.to_string(), to.to_string());
        let mut inner = self.lock();
        if up {
            inner.cut_links.remove(&link);
        } else {
            inner.cut_links.insert(link);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, from: &str, to: &str, message: &StateMessage) {
        let mut inner = self.lock();
        if inner
            .cut_links
            .contains(&(from.to_string(), to.to_string()))
        {
            tracing::debug!(from, to, action = ?message.action, "dropping state message on cut link");
            return;
        }

        let key = (to.to_string(), message.registry_topic.clone());
        if let Some(inboxes) = inner.inboxes.get_mut(&key) {
            inboxes.retain(|inbox| inbox.send((message.clone(), from.to_string())).is_ok());
        }
    }
}

pub struct LocalMessageBus {
    node: String,
    cluster: LocalCluster,
}

impl LocalMessageBus {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl ClusterMessageBus for LocalMessageBus {
    fn subscribe(&self, registry_topic: &str) -> mpsc::UnboundedReceiver<(StateMessage, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cluster
            .lock()
            .inboxes
            .entry((self.node.clone(), registry_topic.to_string()))
            .or_default()
            .push(tx);
        rx
    }

    fn send_state(&self, message: StateMessage) {
        let peers: Vec<String> = self
            .cluster
            .lock()
            .nodes
            .iter()
            .filter(|node| **node != self.node)
            .cloned()
            .collect();
        for peer in peers {
            self.cluster.deliver(&self.node, &peer, &message);
        }
    }

    fn send_state_direct(&self, node: &str, message: StateMessage) {
        if node == self.node {
            return;
        }
        self.cluster.deliver(&self.node, node, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::StateAction;

    fn add(topic: &str, name: &str) -> StateMessage {
        StateMessage::new(topic, StateAction::Add).with_name(name)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_other_topics() {
        let cluster = LocalCluster::new();
        let a = cluster.connect("a");
        let b = cluster.connect("b");
        let mut a_rx = a.subscribe("presence");
        let mut b_rx = b.subscribe("presence");
        let mut b_other = b.subscribe("subscriptions");

        a.send_state(add("presence", "x"));

        let (message, from) = b_rx.recv().await.unwrap();
        assert_eq!(from, "a");
        assert_eq!(message.name.as_deref(), Some("x"));
        assert!(a_rx.try_recv().is_err());
        assert!(b_other.try_recv().is_err());
        assert_eq!(cluster.nodes(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_direct_send_and_cut_links() {
        let cluster = LocalCluster::new();
        let a = cluster.connect("a");
        let b = cluster.connect("b");
        let c = cluster.connect("c");
        let mut b_rx = b.subscribe("t");
        let mut c_rx = c.subscribe("t");

        a.send_state_direct("c", add("t", "only-c"));
        assert_eq!(c_rx.recv().await.unwrap().0.name.as_deref(), Some("only-c"));
        assert!(b_rx.try_recv().is_err());

        cluster.set_link("a", "b", false);
        a.send_state(add("t", "lost"));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(c_rx.recv().await.unwrap().0.name.as_deref(), Some("lost"));

        cluster.set_link("a", "b", true);
        a.send_state(add("t", "found"));
        assert_eq!(b_rx.recv().await.unwrap().0.name.as_deref(), Some("found"));
    }
}
