//! The client-facing side of a record write: who sent it and what they are told.

use crate::record::UpdateAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection that can originate record writes.
///
/// Remote connections stand in for writes forwarded by another cluster node;
/// they are never told about queue failures since the owning node does that.
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    fn user(&self) -> &str;

    fn is_remote(&self) -> bool {
        false
    }

    fn send(&self, message: OutboundMessage);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    VersionExists {
        name: String,
        version: u64,
        data: Value,
        original_action: UpdateAction,
    },
    InvalidMessageData {
        name: String,
        original_action: UpdateAction,
    },
    WriteAcknowledgement {
        name: String,
        correlation_id: String,
    },
    RecordUpdateError {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
