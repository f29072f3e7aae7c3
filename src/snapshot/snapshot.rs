use crate::commitlog::Index;
use crate::grpc::ProtoSnapshot;
use crate::replica::{Membership, Term};
use bytes::Bytes;
use prost::Message;
use std::fmt;
use std::io;

/// A point-in-time image of the state machine together with the log position it covers.
#[derive(Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    // Voters in effect at `last_included_index`. The log entries that carried it may be compacted.
    pub(crate) membership: Membership,
    pub(crate) data: Bytes,
    pub(crate) created_at_millis: i64,
}

impl Snapshot {
    pub(crate) fn to_proto(&self) -> ProtoSnapshot {
        ProtoSnapshot {
            last_included_index: self.last_included_index.as_u64(),
            last_included_term: self.last_included_term.as_u64(),
            membership: Some(self.membership.to_proto()),
            data: self.data.to_vec(),
            created_at_millis: self.created_at_millis,
        }
    }

    pub(crate) fn from_proto(proto: ProtoSnapshot) -> Result<Self, io::Error> {
        if proto.last_included_index == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot last included index is 0",
            ));
        }
        let membership = match proto.membership {
            Some(m) => Membership::from_proto(m)?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "snapshot is missing membership",
                ))
            }
        };

        Ok(Snapshot {
            last_included_index: Index::new(proto.last_included_index),
            last_included_term: Term::new(proto.last_included_term),
            membership,
            data: Bytes::from(proto.data),
            created_at_millis: proto.created_at_millis,
        })
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let proto = self.to_proto();
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("Vec<u8> always has capacity to encode a snapshot");
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, io::Error> {
        let proto = ProtoSnapshot::decode(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Self::from_proto(proto)
    }
}

// Data can be megabytes, keep it out of logs.
impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("last_included_index", &self.last_included_index)
            .field("last_included_term", &self.last_included_term)
            .field("membership", &self.membership)
            .field("data_len", &self.data.len())
            .field("created_at_millis", &self.created_at_millis)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;

    #[test]
    fn decode_rejects_missing_membership_and_zero_index() {
        let snapshot = Snapshot {
            last_included_index: Index::new(7),
            last_included_term: Term::new(2),
            membership: Membership::singleton(ReplicaId::new("a"), "127.0.0.1:7000".into()),
            data: Bytes::from_static(b"cache"),
            created_at_millis: 1_600_000_000_000,
        };
        assert_eq!(Snapshot::decode(&snapshot.encode()).unwrap(), snapshot);

        let mut proto = snapshot.to_proto();
        proto.membership = None;
        let mut buf = Vec::new();
        proto.encode(&mut buf).unwrap();
        assert_eq!(
            Snapshot::decode(&buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        let mut proto = snapshot.to_proto();
        proto.last_included_index = 0;
        assert!(Snapshot::from_proto(proto).is_err());
    }

    #[test]
    fn debug_omits_data() {
        let snapshot = Snapshot {
            last_included_index: Index::new(1),
            last_included_term: Term::new(1),
            membership: Membership::empty(),
            data: Bytes::from_static(b"super-secret-value"),
            created_at_millis: 0,
        };
        let printed = format!("{:?}", snapshot);
        assert!(printed.contains("data_len: 18"));
        assert!(!printed.contains("super-secret-value"));
    }
}
