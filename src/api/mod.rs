//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod errors;
mod event_bus;
mod node;
mod options;
mod types;
mod wiring;

#[cfg(test)]
mod cluster_tests;

pub use client::KvClient;
pub use client::KvClientError;
pub use errors::NodeCreationError;
pub use errors::ProposeError;
pub use event_bus::ElectionEvent;
pub use event_bus::Event;
pub use event_bus::EventListener;
pub use event_bus::FollowerEventData;
pub use node::RaftKvNode;
pub use options::RaftOptions;
pub use types::NodeStatus;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use wiring::try_create_node;
pub use wiring::RaftKvConfig;

// So the KV server can serve a node.
pub(crate) use node::NodeCore;
