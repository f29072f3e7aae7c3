use crate::api::{NodeCore, ProposeError};
use crate::grpc::grpc_kv_server::{GrpcKv, GrpcKvServer};
use crate::grpc::{
    proto_kv_error, proto_kv_result, ProtoCommitTimeout, ProtoGetReq, ProtoGetResult, ProtoJoinReq, ProtoKvError,
    ProtoKvResult, ProtoKvSuccess, ProtoMembershipConflict, ProtoNotLeader, ProtoRemoveReq, ProtoServerFault,
    ProtoSetReq,
};
use crate::server::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// KvService is the client-facing gRPC API of a node.
pub(crate) struct KvService {
    logger: slog::Logger,
    node: Arc<NodeCore>,
}

impl KvService {
    pub(crate) fn new(logger: slog::Logger, node: Arc<NodeCore>) -> Self {
        KvService { logger, node }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: ShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "KV server listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcKvServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "KV server run() has exited: {:?}", result);
    }

    fn convert_propose_result(&self, result: Result<(), ProposeError>) -> ProtoKvResult {
        let err = match result {
            Ok(()) => {
                return ProtoKvResult {
                    result: Some(proto_kv_result::Result::Ok(ProtoKvSuccess {})),
                }
            }
            Err(ProposeError::NotLeader(leader)) => {
                let (leader_id, leader_address) = leader
                    .map(|l| (l.replica_id, l.raft_address))
                    .unwrap_or_default();
                proto_kv_error::Err::NotLeader(ProtoNotLeader {
                    leader_id,
                    leader_address,
                })
            }
            Err(ProposeError::NoLeader) => proto_kv_error::Err::NotLeader(ProtoNotLeader::default()),
            Err(ProposeError::CommitTimeout) => proto_kv_error::Err::Timeout(ProtoCommitTimeout {}),
            Err(ProposeError::MembershipConflict) => {
                proto_kv_error::Err::MembershipConflict(ProtoMembershipConflict {})
            }
            Err(e) => {
                slog::warn!(self.logger, "Request failed: {:?}", e);
                proto_kv_error::Err::Internal(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoKvResult {
            result: Some(proto_kv_result::Result::Err(ProtoKvError { err: Some(err) })),
        }
    }
}

#[tonic::async_trait]
impl GrpcKv for KvService {
    async fn get(&self, request: Request<ProtoGetReq>) -> Result<Response<ProtoGetResult>, Status> {
        let request = request.into_inner();
        if request.key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }
        let value = self.node.get(&request.key).unwrap_or_default();

        Ok(Response::new(ProtoGetResult { value }))
    }

    async fn set(&self, request: Request<ProtoSetReq>) -> Result<Response<ProtoKvResult>, Status> {
        let request = request.into_inner();
        if request.key.is_empty() || request.value.is_empty() {
            return Err(Status::invalid_argument("key and value are required"));
        }
        let result = self.node.set(request.key, request.value).await;

        Ok(Response::new(self.convert_propose_result(result)))
    }

    async fn join(&self, request: Request<ProtoJoinReq>) -> Result<Response<ProtoKvResult>, Status> {
        let request = request.into_inner();
        if request.peer_id.is_empty() || request.peer_address.is_empty() {
            return Err(Status::invalid_argument("peer_id and peer_address are required"));
        }
        let result = self.node.add_voter(request.peer_id, request.peer_address).await;

        Ok(Response::new(self.convert_propose_result(result)))
    }

    async fn remove(&self, request: Request<ProtoRemoveReq>) -> Result<Response<ProtoKvResult>, Status> {
        let request = request.into_inner();
        if request.peer_id.is_empty() {
            return Err(Status::invalid_argument("peer_id is required"));
        }
        let result = self.node.remove_voter(request.peer_id).await;

        Ok(Response::new(self.convert_propose_result(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{try_create_node, RaftKvConfig, RaftKvNode, RaftOptions};
    use tonic::Code;

    async fn single_node(dir: &tempfile::TempDir) -> RaftKvNode {
        try_create_node(RaftKvConfig {
            replica_id: "node-1".into(),
            raft_address: "127.0.0.1:0".into(),
            client_address: None,
            data_dir: dir.path().to_path_buf(),
            bootstrap: true,
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            options: RaftOptions::default(),
        })
        .await
        .unwrap()
    }

    fn service(node: &RaftKvNode) -> KvService {
        KvService::new(slog::Logger::root(slog::Discard, slog::o!()), node.core().clone())
    }

    #[tokio::test]
    async fn get_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(&dir).await;
        let service = service(&node);

        let status = service
            .get(Request::new(ProtoGetReq { key: String::new() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let response = service
            .get(Request::new(ProtoGetReq { key: "missing".into() }))
            .await
            .unwrap();
        assert_eq!(response.into_inner().value, "");
    }

    #[tokio::test]
    async fn set_without_key_or_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(&dir).await;
        let service = service(&node);

        for (key, value) in [("", "v"), ("k", ""), ("", "")].iter() {
            let status = service
                .set(Request::new(ProtoSetReq {
                    key: key.to_string(),
                    value: value.to_string(),
                }))
                .await
                .unwrap_err();
            assert_eq!(status.code(), Code::InvalidArgument);
        }
        assert_eq!(node.get("k"), None);
    }
}
