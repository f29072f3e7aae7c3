//! The key-value application replicated by raft.
mod cache;
mod command;
mod state_machine;
mod write_gate;

pub(crate) use cache::Cache;
pub(crate) use command::KvCommand;
pub(crate) use state_machine::KvStateMachine;
pub(crate) use write_gate::WriteGate;
