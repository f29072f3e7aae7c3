use crate::commitlog;
use crate::commitlog::Index;
use crate::snapshot::Snapshot;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

const SNAPSHOT_FILE_NAME: &str = "latest.snap";
const SNAPSHOT_TMP_FILE_NAME: &str = "latest.snap.tmp";

/// Holds the single latest snapshot of a replica. It is written both by the snapshot manager
/// (our own snapshots) and by the replica (snapshots installed by a leader), so a write only lands
/// if it is newer than what is already stored.
pub(crate) trait SnapshotStore: Send + Sync {
    /// Returns true if `snapshot` is now the latest stored snapshot.
    fn persist_if_newer(&self, snapshot: &Snapshot) -> Result<bool, io::Error>;

    fn load_latest(&self) -> Result<Option<Snapshot>, io::Error>;
}

pub(crate) struct DiskSnapshotStore {
    directory: PathBuf,
    latest_index: Mutex<Option<Index>>,
}

impl DiskSnapshotStore {
    pub(crate) fn open(directory: PathBuf) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;
        let store = DiskSnapshotStore {
            directory,
            latest_index: Mutex::new(None),
        };
        let latest_index = store.load_latest()?.map(|s| s.last_included_index);
        *store.latest_index.lock().expect("DiskSnapshotStore mutex guard poison") = latest_index;

        Ok(store)
    }
}

impl SnapshotStore for DiskSnapshotStore {
    fn persist_if_newer(&self, snapshot: &Snapshot) -> Result<bool, io::Error> {
        // Held across the write so two writers can't interleave their renames.
        let mut latest_index = self.latest_index.lock().expect("DiskSnapshotStore mutex guard poison");
        if matches!(*latest_index, Some(latest) if latest >= snapshot.last_included_index) {
            return Ok(false);
        }

        let tmp_path = self.directory.join(SNAPSHOT_TMP_FILE_NAME);
        let mut tmp = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        tmp.write_all(&snapshot.encode())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.directory.join(SNAPSHOT_FILE_NAME))?;
        commitlog::sync_dir(&self.directory)?;

        latest_index.replace(snapshot.last_included_index);
        Ok(true)
    }

    fn load_latest(&self) -> Result<Option<Snapshot>, io::Error> {
        match fs::read(self.directory.join(SNAPSHOT_FILE_NAME)) {
            Ok(bytes) => Snapshot::decode(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) use in_memory::{FailingSnapshotStore, InMemorySnapshotStore};
