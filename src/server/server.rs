use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientStaleTerm,
    ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess,
    ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, EntryPayload,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, LeaderRedirectInfo, ReplicaId,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, Term,
};
use crate::server::ShutdownSignal;
use crate::snapshot::Snapshot;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: ShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Raft server listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Raft server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoRequestVoteResult {
                    result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                        vote_granted: ok.vote_granted,
                    })),
                }
            }
            Err(RequestVoteError::RequestTermOutOfDate(term_info)) => {
                proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(RequestVoteError::ServerIoError(_)) => proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                message: "Local IO failure".to_string(),
            }),
            Err(RequestVoteError::ActorExited) => proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let leader_commit_index = Self::convert_optional_index(rpc_request.commit_index);

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            let payload = EntryPayload::from_bytes(&proto_entry.data)
                .map_err(|e| Status::invalid_argument(format!("Malformed log entry: {}", e)))?;
            new_entries.push(AppendEntriesLogEntry {
                term: Term::new(proto_entry.term),
                payload,
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader: LeaderRedirectInfo {
                replica_id: ReplicaId::new(rpc_request.client_node_id),
                raft_address: rpc_request.client_node_address,
            },
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_optional_index(index: u64) -> Option<Index> {
        match index {
            0 => None,
            index => Some(Index::new(index)),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        // Empty
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: last_log_index.map(|i| i.as_u64()).unwrap_or(0),
                })
            }
            Err(AppendEntriesError::ServerIoError(_)) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                })
            }
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })),
        }
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = Self::convert_install_snapshot_input(rpc_request)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        let rpc_reply = Self::convert_install_snapshot_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, Status> {
        let proto_snapshot = rpc_request
            .snapshot
            .ok_or_else(|| Status::invalid_argument("InstallSnapshot is missing the snapshot"))?;
        let snapshot = Snapshot::from_proto(proto_snapshot)
            .map_err(|e| Status::invalid_argument(format!("Malformed snapshot: {}", e)))?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader: LeaderRedirectInfo {
                replica_id: ReplicaId::new(rpc_request.client_node_id),
                raft_address: rpc_request.client_node_address,
            },
            snapshot: Arc::new(snapshot),
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        // Empty
                    })),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::ServerIoError(_)) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                })
            }
            Err(InstallSnapshotError::ActorExited) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Server internal replica task has exited".to_string(),
                })
            }
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries(term={}, {} entries)",
            rpc_request.term,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - InstallSnapshot(term={})", rpc_request.term);
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
