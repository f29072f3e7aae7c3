use crate::grpc::{proto_kv_command, ProtoKvCommand, ProtoKvSet};
use prost::Message;
use std::io;

/// A write to the key-value store, as carried in a log entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum KvCommand {
    Set { key: String, value: String },
}

impl KvCommand {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let proto = match self {
            KvCommand::Set { key, value } => ProtoKvCommand {
                op: Some(proto_kv_command::Op::Set(ProtoKvSet {
                    key: key.clone(),
                    value: value.clone(),
                })),
            },
        };

        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("Vec<u8> has unbounded capacity for prost encoding");
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, io::Error> {
        let proto = ProtoKvCommand::decode(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match proto.op {
            Some(proto_kv_command::Op::Set(set)) => Ok(KvCommand::Set {
                key: set.key,
                value: set.value,
            }),
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "KV command has no operation")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_garbage_commands_are_invalid() {
        assert_eq!(
            KvCommand::decode(&[]).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        assert_eq!(
            KvCommand::decode(b"\xff\xff\xff").unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn set_with_empty_value_survives_encoding() {
        let command = KvCommand::Set {
            key: "k".into(),
            value: String::new(),
        };
        assert_eq!(KvCommand::decode(&command.encode()).unwrap(), command);
    }
}
