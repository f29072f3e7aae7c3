//! This module is a raft-specific commit log that wraps the generic commit log. It owns the commit
//! index, the snapshot boundary, and the stream of committed entries consumed by the applier.

mod commit_stream;
mod log;
mod log_entry;
mod wiring;

pub(crate) use commit_stream::AppliedNotifier;
pub(crate) use commit_stream::ApplyOutcome;
pub(crate) use commit_stream::CommitStream;
pub(crate) use commit_stream::CommitStreamItem;
pub(crate) use commit_stream::CommittedEntry;
pub(crate) use log_entry::EntryPayload;
pub(crate) use log_entry::WriteAheadLogEntry;

pub(crate) use log::WriteAheadLog;
pub(crate) use wiring::wired;
