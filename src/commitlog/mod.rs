mod in_memory;
mod log;
mod storage;

pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use storage::DiskLog;
pub use storage::StorageConfig;

pub(crate) use storage::sync_dir;

#[cfg(test)]
pub(crate) use test_entry::TestEntry;

#[cfg(test)]
mod test_entry {
    use crate::commitlog::Entry;
    use std::convert::TryFrom;
    use std::io;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }
}
