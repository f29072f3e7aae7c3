use crate::commitlog;
use crate::replica::membership::Membership;
use crate::replica::Term;
use bytes::Bytes;
use std::convert::TryFrom;
use std::io;

/// Byte representation:
///
/// ```text
/// |                                         1                                |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | 6 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |Knd|   Data (variable size)     ... |
/// +---+-------------------------------+---+----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created
/// * `Knd` - what the entry carries: application command, membership change, or leader no-op
/// * `Data` - kind specific payload
///
/// Not needed:
///
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    /// Opaque application command for the state machine.
    Command(Bytes),
    /// Full voter set that takes effect once this entry is in the log.
    Membership(Membership),
    /// Appended by each new leader so it can commit entries from previous terms.
    Noop,
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const ENTRY_HEADER_LEN: usize = 1 + 8;

const KIND_COMMAND: u8 = 0;
const KIND_MEMBERSHIP: u8 = 1;
const KIND_NOOP: u8 = 2;

impl EntryPayload {
    /// `| Knd | Data |` portion of the entry. This is also what's sent over the wire.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_bytes(&mut bytes);
        bytes
    }

    fn write_bytes(&self, bytes: &mut Vec<u8>) {
        match self {
            EntryPayload::Command(data) => {
                bytes.push(KIND_COMMAND);
                bytes.extend_from_slice(data);
            }
            EntryPayload::Membership(membership) => {
                bytes.push(KIND_MEMBERSHIP);
                bytes.extend_from_slice(&membership.encode());
            }
            EntryPayload::Noop => bytes.push(KIND_NOOP),
        }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, io::Error> {
        match bytes.split_first() {
            Some((&KIND_COMMAND, data)) => Ok(EntryPayload::Command(Bytes::copy_from_slice(data))),
            Some((&KIND_MEMBERSHIP, data)) => Membership::decode(data).map(EntryPayload::Membership),
            Some((&KIND_NOOP, _)) => Ok(EntryPayload::Noop),
            Some((kind, _)) => Err(invalid_data(format!("unknown log entry kind {}", kind))),
            None => Err(invalid_data("log entry payload is empty".to_string())),
        }
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(invalid_data(format!("log entry too short: {} bytes", bytes.len())));
        }
        if bytes[0] != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(invalid_data(format!("unsupported log entry version {}", bytes[0])));
        }

        let mut term_bytes = [0u8; 8];
        term_bytes.copy_from_slice(&bytes[1..ENTRY_HEADER_LEN]);

        Ok(WriteAheadLogEntry {
            term: Term::new(u64::from_le_bytes(term_bytes)),
            payload: EntryPayload::from_bytes(&bytes[ENTRY_HEADER_LEN..])?,
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(ENTRY_HEADER_LEN + 1);

        bytes.push(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        entry.payload.write_bytes(&mut bytes);

        bytes
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;

    #[test]
    fn term_is_little_endian_after_version() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            payload: EntryPayload::Command(Bytes::from_static(b"hi")),
        };
        let bytes: Vec<u8> = entry.clone().into();

        assert_eq!(bytes, vec![2, 0x02, 0x01, 0, 0, 0, 0, 0, 0, KIND_COMMAND, b'h', b'i']);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn membership_and_noop_entries_decode() {
        let membership = Membership::singleton(ReplicaId::new("n1"), "127.0.0.1:7000".into());
        for payload in vec![EntryPayload::Membership(membership), EntryPayload::Noop] {
            let entry = WriteAheadLogEntry {
                term: Term::new(9),
                payload,
            };
            let bytes: Vec<u8> = entry.clone().into();
            assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
        }
    }

    #[test]
    fn malformed_bytes_are_errors_not_panics() {
        assert!(WriteAheadLogEntry::try_from(vec![]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![2, 1, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // Header only, missing kind.
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 0, 42]).is_err());
    }
}
