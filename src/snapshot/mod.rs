//! Snapshots fold a prefix of the log into a serialized state machine image.
mod manager;
mod policy;
mod snapshot;
mod store;

pub(crate) use manager::SnapshotManager;
pub(crate) use policy::SnapshotPolicy;
pub(crate) use snapshot::Snapshot;
pub(crate) use store::DiskSnapshotStore;
pub(crate) use store::SnapshotStore;

#[cfg(test)]
pub(crate) use store::{FailingSnapshotStore, InMemorySnapshotStore};
