use crate::commitlog;
use crate::replica::write_ahead_log::{commit_stream, WriteAheadLog};
use crate::replica::{CommitStream, WriteAheadLogEntry};
use crate::snapshot::Snapshot;
use std::io;
use std::sync::Arc;

pub(crate) fn wired<L>(
    logger: slog::Logger,
    log: L,
    latest_snapshot: Option<Arc<Snapshot>>,
) -> Result<(WriteAheadLog<L>, CommitStream), io::Error>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    let (publisher, stream) = commit_stream::new();

    let wal = WriteAheadLog::new(logger, log, latest_snapshot, publisher)?;

    Ok((wal, stream))
}
