use crate::grpc::grpc_kv_client::GrpcKvClient;
use crate::grpc::{
    proto_kv_error, proto_kv_result, ProtoGetReq, ProtoJoinReq, ProtoKvResult, ProtoRemoveReq, ProtoSetReq,
};
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum KvClientError {
    #[error("Invalid address: {0}")]
    InvalidUri(#[from] uri::InvalidUri),
    #[error("Failed to connect: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("RPC failed: {0}")]
    Rpc(#[from] tonic::Status),
    /// Leader fields are None if the server doesn't know who is leader.
    #[error("Node is not leader. Leader: {leader_id:?} at {leader_address:?}")]
    NotLeader {
        leader_id: Option<String>,
        leader_address: Option<String>,
    },
    #[error("Timed out waiting for commit. The write may still take effect.")]
    CommitTimeout,
    #[error("Membership change conflicts with one in progress")]
    MembershipConflict,
    #[error("Server failure: {0}")]
    Internal(String),
    #[error("Server reply was malformed")]
    MalformedReply,
}

/// KvClient talks to one node's client-facing API. It doesn't follow leader redirects.
#[derive(Clone)]
pub struct KvClient {
    client: GrpcKvClient<Channel>,
}

impl KvClient {
    /// `address` is `host:port`.
    pub async fn connect(address: &str) -> Result<Self, KvClientError> {
        let channel = Endpoint::from_shared(format!("http://{}", address))?
            .connect()
            .await?;

        Ok(KvClient {
            client: GrpcKvClient::new(channel),
        })
    }

    /// Returns an empty string if the key is absent.
    pub async fn get(&mut self, key: impl Into<String>) -> Result<String, KvClientError> {
        let reply = self.client.get(ProtoGetReq { key: key.into() }).await?;

        Ok(reply.into_inner().value)
    }

    pub async fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), KvClientError> {
        let reply = self
            .client
            .set(ProtoSetReq {
                key: key.into(),
                value: value.into(),
            })
            .await?;

        convert_kv_result(reply.into_inner())
    }

    pub async fn join(
        &mut self,
        peer_id: impl Into<String>,
        peer_address: impl Into<String>,
    ) -> Result<(), KvClientError> {
        let reply = self
            .client
            .join(ProtoJoinReq {
                peer_id: peer_id.into(),
                peer_address: peer_address.into(),
            })
            .await?;

        convert_kv_result(reply.into_inner())
    }

    pub async fn remove(&mut self, peer_id: impl Into<String>) -> Result<(), KvClientError> {
        let reply = self
            .client
            .remove(ProtoRemoveReq {
                peer_id: peer_id.into(),
            })
            .await?;

        convert_kv_result(reply.into_inner())
    }
}

fn convert_kv_result(reply: ProtoKvResult) -> Result<(), KvClientError> {
    let err = match reply.result {
        Some(proto_kv_result::Result::Ok(_)) => return Ok(()),
        Some(proto_kv_result::Result::Err(err)) => err.err,
        None => None,
    };

    match err {
        Some(proto_kv_error::Err::NotLeader(leader)) => Err(KvClientError::NotLeader {
            leader_id: non_empty(leader.leader_id),
            leader_address: non_empty(leader.leader_address),
        }),
        Some(proto_kv_error::Err::Timeout(_)) => Err(KvClientError::CommitTimeout),
        Some(proto_kv_error::Err::MembershipConflict(_)) => Err(KvClientError::MembershipConflict),
        Some(proto_kv_error::Err::Internal(fault)) => Err(KvClientError::Internal(fault.message)),
        None => Err(KvClientError::MalformedReply),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{ProtoKvError, ProtoNotLeader};

    #[test]
    fn not_leader_without_hint() {
        let reply = ProtoKvResult {
            result: Some(proto_kv_result::Result::Err(ProtoKvError {
                err: Some(proto_kv_error::Err::NotLeader(ProtoNotLeader::default())),
            })),
        };

        match convert_kv_result(reply) {
            Err(KvClientError::NotLeader {
                leader_id: None,
                leader_address: None,
            }) => {}
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_reply_is_malformed() {
        assert!(matches!(
            convert_kv_result(ProtoKvResult { result: None }),
            Err(KvClientError::MalformedReply)
        ));
    }
}
