use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const STATE_REGISTRY_TOPIC: &str = "STATE_REGISTRY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateAction {
    Add,
    Remove,
    Checksum,
    RequestFullState,
    FullState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub topic: String,
    pub registry_topic: String,
    pub action: StateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_state: Option<Vec<String>>,
}

impl StateMessage {
    pub fn new(registry_topic: impl Into<String>, action: StateAction) -> Self {
        Self {
            topic: STATE_REGISTRY_TOPIC.to_string(),
            registry_topic: registry_topic.into(),
            action,
            name: None,
            checksum: None,
            full_state: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_checksum(mut self, checksum: i64) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_full_state(mut self, full_state: Vec<String>) -> Self {
        self.full_state = Some(full_state);
        self
    }
}

/// Unreliable, ordered-per-sender delivery of registry messages between nodes.
///
/// Sends never block; delivery is not guaranteed.
pub trait ClusterMessageBus: Send + Sync {
    /// Messages for `registry_topic` from other nodes, with the sender's node id.
    fn subscribe(&self, registry_topic: &str) -> mpsc::UnboundedReceiver<(StateMessage, String)>;

    /// Broadcasts to every other node subscribed to the message's registry topic.
    fn send_state(&self, message: StateMessage);

    fn send_state_direct(&self, node: &str, message: StateMessage);
}
