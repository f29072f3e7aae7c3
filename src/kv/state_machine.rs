use crate::grpc::ProtoCacheImage;
use crate::kv::{Cache, KvCommand};
use crate::state_machine::StateMachine;
use prost::Message;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

pub(crate) struct KvStateMachine {
    cache: Arc<Cache>,
}

impl KvStateMachine {
    pub(crate) fn new(cache: Arc<Cache>) -> Self {
        KvStateMachine { cache }
    }
}

impl StateMachine for KvStateMachine {
    type Image = Arc<HashMap<String, String>>;

    fn apply(&self, command: &[u8]) -> Result<(), io::Error> {
        match KvCommand::decode(command)? {
            KvCommand::Set { key, value } => self.cache.set(key, value),
        }

        Ok(())
    }

    fn capture(&self) -> Self::Image {
        self.cache.capture()
    }

    fn serialize_image(image: &Self::Image) -> Vec<u8> {
        let proto = ProtoCacheImage {
            entries: image.as_ref().clone(),
        };
        let mut buf = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut buf)
            .expect("Vec<u8> has unbounded capacity for prost encoding");
        buf
    }

    fn restore(&self, data: &[u8]) -> Result<(), io::Error> {
        let proto = ProtoCacheImage::decode(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.cache.replace(proto.entries);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(sm: &KvStateMachine, key: &str, value: &str) {
        let command = KvCommand::Set {
            key: key.into(),
            value: value.into(),
        };
        sm.apply(&command.encode()).unwrap();
    }

    #[test]
    fn snapshot_restore_reproduces_state() {
        let source = KvStateMachine::new(Arc::new(Cache::new()));
        set(&source, "a", "1");
        set(&source, "b", "2");
        set(&source, "a", "3");
        let data = KvStateMachine::serialize_image(&source.capture());

        let target_cache = Arc::new(Cache::new());
        target_cache.set("leftover".into(), "x".into());
        let target = KvStateMachine::new(target_cache.clone());
        target.restore(&data).unwrap();

        assert_eq!(target_cache.get("a"), Some("3".to_string()));
        assert_eq!(target_cache.get("b"), Some("2".to_string()));
        assert_eq!(target_cache.get("leftover"), None);
        assert_eq!(*target.capture(), *source.capture());
    }

    #[test]
    fn same_commands_same_state() {
        let commands: Vec<Vec<u8>> = (0..20)
            .map(|i| {
                KvCommand::Set {
                    key: format!("k{}", i % 7),
                    value: format!("v{}", i),
                }
                .encode()
            })
            .collect();

        let a = KvStateMachine::new(Arc::new(Cache::new()));
        let b = KvStateMachine::new(Arc::new(Cache::new()));
        for command in &commands {
            a.apply(command).unwrap();
            b.apply(command).unwrap();
        }

        assert_eq!(*a.capture(), *b.capture());
    }

    #[test]
    fn malformed_command_leaves_state_untouched() {
        let cache = Arc::new(Cache::new());
        let sm = KvStateMachine::new(cache.clone());
        set(&sm, "a", "1");

        let err = sm.apply(b"\x0a\x03bad").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(cache.len(), 1);
        assert!(sm.restore(b"\xff\xff").is_err());
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }
}
