use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

// File layout:
//
// ```text
// +-------------------------------+
// | first index (8 bytes, LE)     |  header
// +-------------------------------+
// | len (4, LE) | crc32 (4, LE) | payload |  record for `first index`
// | len (4, LE) | crc32 (4, LE) | payload |  record for `first index + 1`
// | ...                           |
// +-------------------------------+
// ```
//
// The CRC covers the payload. A record that was cut short by a crash, or the last record failing
// its CRC, is a torn write and is dropped on open. A CRC failure anywhere else is corruption.
const HEADER_LEN: u64 = 8;
const RECORD_PREFIX_LEN: u64 = 8;
const LOG_FILE_NAME: &str = "entries.log";
const COMPACTION_FILE_NAME: &str = "entries.log.compacting";

/// Generic config for initializing any type of disk-based commit log, independent of data
/// model and algorithm.
pub struct StorageConfig {
    pub directory: PathBuf,
}

/// DiskLog is a single-file durable log. Every mutation is fsync'd before returning. Entries are
/// mirrored in memory for reads, so memory use is bounded by how often the log is compacted.
pub struct DiskLog<E: Entry> {
    directory: PathBuf,
    file: File,
    first_index: Index,
    // Byte offset of each record, parallel to `entries`.
    offsets: Vec<u64>,
    entries: Vec<Vec<u8>>,
    file_len: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> DiskLog<E> {
    pub fn open(config: StorageConfig) -> Result<Self, io::Error> {
        fs::create_dir_all(&config.directory)?;
        let path = config.directory.join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if (contents.len() as u64) < HEADER_LEN {
            // Fresh file, or the header itself was torn. Nothing could have been appended yet.
            write_fresh_log_file(&mut file, Index::start_index())?;
            return Ok(DiskLog {
                directory: config.directory,
                file,
                first_index: Index::start_index(),
                offsets: Vec::new(),
                entries: Vec::new(),
                file_len: HEADER_LEN,
                _pd: PhantomData::default(),
            });
        }

        let first_index = read_header(&contents)?;
        let (offsets, entries, valid_len) = parse_records(&contents)?;
        if valid_len < contents.len() as u64 {
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        Ok(DiskLog {
            directory: config.directory,
            file,
            first_index,
            offsets,
            entries,
            file_len: valid_len,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some(self.first_index.distance_to(index) as usize)
        }
    }

    fn rewrite_from(&mut self, new_first_index: Index, keep_from: usize) -> Result<(), io::Error> {
        let tmp_path = self.directory.join(COMPACTION_FILE_NAME);
        let final_path = self.directory.join(LOG_FILE_NAME);

        let kept = self.entries[keep_from.min(self.entries.len())..].to_vec();

        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        buf.extend_from_slice(&new_first_index.as_u64().to_le_bytes());
        let mut offsets = Vec::with_capacity(kept.len());
        for payload in kept.iter() {
            offsets.push(buf.len() as u64);
            encode_record(&mut buf, payload);
        }
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.directory)?;

        self.file = OpenOptions::new().read(true).write(true).open(&final_path)?;
        self.first_index = new_first_index;
        self.offsets = offsets;
        self.entries = kept;
        self.file_len = buf.len() as u64;

        Ok(())
    }
}

impl<E: Entry> Log<E> for DiskLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        let payload: Vec<u8> = entry.into();

        let mut buf = Vec::with_capacity(RECORD_PREFIX_LEN as usize + payload.len());
        encode_record(&mut buf, &payload);

        self.file.seek(SeekFrom::Start(self.file_len))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        // Only update state after the disk write completes.
        self.offsets.push(self.file_len);
        self.file_len += buf.len() as u64;
        self.entries.push(payload);

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.entries.get(i)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        if vec_index >= self.entries.len() {
            return Ok(());
        }

        let new_len = self.offsets[vec_index];
        self.file.set_len(new_len)?;
        self.file.sync_data()?;

        self.offsets.truncate(vec_index);
        self.entries.truncate(vec_index);
        self.file_len = new_len;

        Ok(())
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        let new_first_index = through.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        let keep_from = self.first_index.distance_to(new_first_index) as usize;
        self.rewrite_from(new_first_index, keep_from)
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.entries.len() as u64)
    }
}

fn write_fresh_log_file(file: &mut File, first_index: Index) -> Result<(), io::Error> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&first_index.as_u64().to_le_bytes())?;
    file.sync_all()
}

fn read_header(contents: &[u8]) -> Result<Index, io::Error> {
    let mut header = [0u8; HEADER_LEN as usize];
    header.copy_from_slice(&contents[..HEADER_LEN as usize]);
    match u64::from_le_bytes(header) {
        0 => Err(io::Error::new(io::ErrorKind::InvalidData, "log header has first index 0")),
        first_index => Ok(Index::new(first_index)),
    }
}

/// Returns record offsets, payloads, and the length of the well-formed prefix of the file.
fn parse_records(contents: &[u8]) -> Result<(Vec<u64>, Vec<Vec<u8>>, u64), io::Error> {
    let mut offsets = Vec::new();
    let mut entries = Vec::new();
    let mut pos = HEADER_LEN as usize;

    while pos + RECORD_PREFIX_LEN as usize <= contents.len() {
        let len = read_u32_le(&contents[pos..pos + 4]) as usize;
        let stored_crc = read_u32_le(&contents[pos + 4..pos + 8]);

        let payload_start = pos + RECORD_PREFIX_LEN as usize;
        let payload_end = payload_start + len;
        if payload_end > contents.len() {
            break;
        }

        let payload = &contents[payload_start..payload_end];
        let computed_crc = crc32fast::hash(payload);
        if computed_crc != stored_crc {
            if payload_end == contents.len() {
                break;
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Log record {} at offset {} failed CRC check: stored {:#010x}, computed {:#010x}",
                    offsets.len(),
                    pos,
                    stored_crc,
                    computed_crc
                ),
            ));
        }

        offsets.push(pos as u64);
        entries.push(payload.to_vec());
        pos = payload_end;
    }

    Ok((offsets, entries, pos as u64))
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn encode_record(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Flush a directory's metadata so a rename inside it survives a crash.
pub(crate) fn sync_dir(directory: &Path) -> Result<(), io::Error> {
    File::open(directory)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::TestEntry;

    fn open(dir: &Path) -> DiskLog<TestEntry> {
        DiskLog::open(StorageConfig {
            directory: dir.to_path_buf(),
        })
        .unwrap()
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            for i in 1..=3u8 {
                log.append(TestEntry(vec![i; i as usize])).unwrap();
            }
        }

        let log = open(dir.path());
        assert_eq!(log.first_index(), Index::new(1));
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(TestEntry(vec![2, 2])));
    }

    #[test]
    fn truncate_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            for i in 1..=5u8 {
                log.append(TestEntry(vec![i])).unwrap();
            }
            log.truncate(Index::new(3)).unwrap();
            log.append(TestEntry(vec![30])).unwrap();
        }

        let log = open(dir.path());
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(TestEntry(vec![30])));
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            for i in 1..=5u8 {
                log.append(TestEntry(vec![i])).unwrap();
            }
            log.compact(Index::new(3)).unwrap();
            log.append(TestEntry(vec![6])).unwrap();
        }

        let mut log = open(dir.path());
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(7));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(6)).unwrap(), Some(TestEntry(vec![6])));

        // Past the tail: log is reset to start right after the compaction point.
        log.compact(Index::new(20)).unwrap();
        drop(log);
        let log = open(dir.path());
        assert_eq!(log.first_index(), Index::new(21));
        assert_eq!(log.next_index(), Index::new(21));
    }

    #[test]
    fn torn_tail_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            log.append(TestEntry(vec![1, 1, 1])).unwrap();
            log.append(TestEntry(vec![2, 2, 2])).unwrap();
        }

        // Simulate a crash midway through writing the second record's payload.
        let path = dir.path().join(LOG_FILE_NAME);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 2).unwrap();

        let mut log = open(dir.path());
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.append(TestEntry(vec![9])).unwrap(), Index::new(2));
        drop(log);

        let log = open(dir.path());
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(TestEntry(vec![9])));
    }

    fn flip_byte(path: &Path, offset_from_end: u64, value: u8) {
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        let len = file.metadata().unwrap().len();
        file.seek(SeekFrom::Start(len - offset_from_end)).unwrap();
        file.write_all(&[value]).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn corrupt_tail_record_is_dropped_as_torn() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            log.append(TestEntry(b"value=v0".to_vec())).unwrap();
            log.append(TestEntry(b"value=v1".to_vec())).unwrap();
        }

        // Last payload byte '1' becomes '2'. The record must not be read back as "value=v2".
        flip_byte(&dir.path().join(LOG_FILE_NAME), 1, b'2');

        let log = open(dir.path());
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.read(Index::new(1)).unwrap(), Some(TestEntry(b"value=v0".to_vec())));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
    }

    #[test]
    fn corrupt_record_before_tail_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(dir.path());
            log.append(TestEntry(b"value=v1".to_vec())).unwrap();
            log.append(TestEntry(b"tail".to_vec())).unwrap();
        }

        // Skip the second record (8 byte prefix + 4 byte payload) and hit the first one's last byte.
        flip_byte(&dir.path().join(LOG_FILE_NAME), 13, b'2');

        let err = DiskLog::<TestEntry>::open(StorageConfig {
            directory: dir.path().to_path_buf(),
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
