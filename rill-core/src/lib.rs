//! Rill Core - realtime record synchronization with cluster-replicated state
//!
//! Two subsystems live here:
//! - record transitions: serialized, versioned application of updates and
//!   patches to one named record, persisted to a cache and a durable store
//! - distributed state registries: per-topic membership sets replicated across
//!   cluster nodes by checksum-verified gossip

pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod record;
pub mod storage;

pub use cluster::{
    ClusterMessageBus, DistributedStateRegistry, LocalCluster, LocalMessageBus, RegistryEvent,
    STATE_REGISTRY_TOPIC, StateAction, StateMessage, create_checksum,
};
pub use config::{RecordConfig, StateRegistryConfig, StorageExclusion};
pub use connection::{Connection, ConnectionId, OutboundMessage};
pub use error::{Result, RillError};
pub use record::{
    RecordCoordinator, RecordHandler, SubscriptionBroadcaster, TargetVersion, UpdateAction,
    UpdateStep, set_value,
};
pub use storage::{MemoryStore, Record, RedisCache, SqliteStorage, VersionStore};
