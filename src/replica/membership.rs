use crate::grpc::{ProtoMember, ProtoMembership};
use crate::replica::ReplicaId;
use prost::Message;
use std::collections::BTreeMap;
use std::io;

/// Membership is the set of voters (id -> raft address) governing elections and commits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Membership {
    voters: BTreeMap<ReplicaId, String>,
}

impl Membership {
    pub(crate) fn empty() -> Self {
        Membership::default()
    }

    pub(crate) fn singleton(replica_id: ReplicaId, raft_address: String) -> Self {
        let mut m = Membership::empty();
        m.add(replica_id, raft_address);
        m
    }

    pub(crate) fn add(&mut self, replica_id: ReplicaId, raft_address: String) {
        self.voters.insert(replica_id, raft_address);
    }

    pub(crate) fn remove(&mut self, replica_id: &ReplicaId) -> bool {
        self.voters.remove(replica_id).is_some()
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.voters.contains_key(replica_id)
    }

    pub(crate) fn address(&self, replica_id: &ReplicaId) -> Option<&str> {
        self.voters.get(replica_id).map(|a| a.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.voters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub(crate) fn voter_ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.voters.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &str)> {
        self.voters.iter().map(|(id, address)| (id, address.as_str()))
    }

    pub(crate) fn to_proto(&self) -> ProtoMembership {
        ProtoMembership {
            voters: self
                .voters
                .iter()
                .map(|(id, address)| ProtoMember {
                    id: id.as_str().to_string(),
                    address: address.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn from_proto(proto: ProtoMembership) -> Result<Self, io::Error> {
        let mut membership = Membership::empty();
        for member in proto.voters {
            if member.id.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "membership voter with empty id"));
            }
            membership.add(ReplicaId::new(member.id), member.address);
        }

        Ok(membership)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let proto = self.to_proto();
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("Vec<u8> has unbounded capacity for prost encoding");
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, io::Error> {
        let proto = ProtoMembership::decode(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Self::from_proto(proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage() {
        assert!(Membership::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn encoded_voters_keep_addresses() {
        let mut m = Membership::singleton(ReplicaId::new("node1"), "127.0.0.1:7000".into());
        m.add(ReplicaId::new("node2"), "127.0.0.1:7001".into());

        let decoded = Membership::decode(&m.encode()).unwrap();
        assert_eq!(decoded.address(&ReplicaId::new("node2")), Some("127.0.0.1:7001"));
        assert_eq!(decoded, m);

        assert!(m.remove(&ReplicaId::new("node1")));
        assert!(!m.remove(&ReplicaId::new("node1")));
        assert_eq!(m.len(), 1);
    }
}
