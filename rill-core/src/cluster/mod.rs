//! Cluster-replicated state
//!
//! Each registry topic keeps, for every entry, the set of nodes that hold it.
//! Nodes gossip additions and removals over a [`ClusterMessageBus`], compare
//! aggregate checksums to detect drift, and exchange full state to repair it.

pub mod local_bus;
pub mod message;
pub mod state_registry;

pub use local_bus::{LocalCluster, LocalMessageBus};
pub use message::{ClusterMessageBus, STATE_REGISTRY_TOPIC, StateAction, StateMessage};
pub use state_registry::{DistributedStateRegistry, RegistryEvent, create_checksum};
