use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesReq,
    ProtoInstallSnapshotReq, ProtoLogEntry, ProtoRequestVoteReq,
};
use crate::commitlog::Index;
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerError, InstallSnapshotInput, ReplicaId, RequestVoteInput,
    RequestVoteResult, Term,
};
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// PeerClient is how a replica talks to one other replica. Replies come back as domain results;
/// transport failures are folded into the retryable variants.
#[async_trait::async_trait]
pub(crate) trait PeerClient: Send + Sync {
    async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult;

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError>;

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), AppendEntriesReplyFromPeerError>;
}

/// PeerConnector creates clients for peers as they show up in the membership.
pub(crate) trait PeerConnector: Send + Sync {
    fn connect(&self, peer_id: &ReplicaId, raft_address: &str) -> Arc<dyn PeerClient>;
}

pub(crate) struct GrpcPeerConnector {
    logger: slog::Logger,
}

impl GrpcPeerConnector {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcPeerConnector { logger }
    }
}

impl PeerConnector for GrpcPeerConnector {
    fn connect(&self, peer_id: &ReplicaId, raft_address: &str) -> Arc<dyn PeerClient> {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id)));
        let url = if raft_address.starts_with("http://") || raft_address.starts_with("https://") {
            raft_address.to_string()
        } else {
            format!("http://{}", raft_address)
        };

        // Lazy, so a peer that is down doesn't block membership changes. Failures surface per call.
        let inner = Endpoint::from_shared(url.clone())
            .map_err(|e| format!("Invalid peer address {:?}: {:?}", url, e))
            .and_then(|endpoint| {
                endpoint
                    .connect_lazy()
                    .map_err(|e| format!("Can't set up channel to {:?}: {:?}", url, e))
            })
            .map(GrpcRaftClient::new);
        if let Err(e) = &inner {
            slog::error!(logger, "{}", e);
        }

        Arc::new(GrpcPeerClient { logger, inner })
    }
}

pub(crate) struct GrpcPeerClient {
    logger: slog::Logger,
    inner: Result<GrpcRaftClient<Channel>, String>,
}

impl GrpcPeerClient {
    fn client(&self) -> Result<GrpcRaftClient<Channel>, String> {
        self.inner.clone()
    }
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult {
        let mut client = match self.client() {
            Ok(client) => client,
            Err(_) => return RequestVoteResult::RetryableFailure,
        };
        let rpc_request = convert_request_vote_input(input);

        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.request_vote(rpc_request).await;
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        match rpc_reply {
            Ok(rpc_result) => match rpc_result.into_inner().result {
                Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                    if success_reply.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        slog::warn!(self.logger, "RequestVote Service Fault: {:?}", fault.message);
                        RequestVoteResult::RetryableFailure
                    }
                    Some(proto_request_vote_error::Err::StaleTerm(stale)) => RequestVoteResult::StaleTerm {
                        new_term: Term::new(stale.current_term),
                    },
                    None => RequestVoteResult::MalformedReply,
                },
                None => RequestVoteResult::MalformedReply,
            },
            Err(rpc_status) => {
                slog::warn!(self.logger, "Un-modeled failure from RequestVote RPC call: {:?}", rpc_status);
                RequestVoteResult::RetryableFailure
            }
        }
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError> {
        let mut client = self.client().map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;
        let rpc_request = convert_append_entries_input(input);

        slog::debug!(self.logger, "ClientWire - AppendEntries({} entries)", rpc_request.new_entries.len());
        let rpc_reply = client.append_entries(rpc_request).await;
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        let rpc_result = rpc_reply
            .map_err(|rpc_status| {
                AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                    "Un-modeled failure from AppendEntries RPC call: {:?}",
                    rpc_status
                ))
            })?
            .into_inner();

        match rpc_result.result {
            Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
            Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                    AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                        "Explicit server fault: {:?}",
                        payload.message
                    )),
                ),
                Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                        last_log_index: convert_optional_index(payload.last_log_index),
                    })
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Result".into(),
            )),
        }
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), AppendEntriesReplyFromPeerError> {
        let mut client = self.client().map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;
        let rpc_request = ProtoInstallSnapshotReq {
            client_node_id: input.leader.replica_id.into_inner(),
            client_node_address: input.leader.raft_address,
            term: input.leader_term.as_u64(),
            snapshot: Some(input.snapshot.to_proto()),
        };

        slog::debug!(
            self.logger,
            "ClientWire - InstallSnapshot(through {:?})",
            input.snapshot.last_included_index
        );
        let rpc_reply = client.install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        let rpc_result = rpc_reply
            .map_err(|rpc_status| {
                AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                    "Un-modeled failure from InstallSnapshot RPC call: {:?}",
                    rpc_status
                ))
            })?
            .into_inner();

        match rpc_result.result {
            Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
            Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                Some(proto_install_snapshot_error::Err::ServerFault(payload)) => Err(
                    AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                        "Explicit server fault: {:?}",
                        payload.message
                    )),
                ),
                Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed InstallSnapshot Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed InstallSnapshot Result".into(),
            )),
        }
    }
}

fn convert_request_vote_input(input: RequestVoteInput) -> ProtoRequestVoteReq {
    let (last_log_entry_term, last_log_entry_index) = match input.candidate_last_log_entry {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    };

    ProtoRequestVoteReq {
        client_node_id: input.candidate_id.into_inner(),
        term: input.candidate_term.as_u64(),
        last_log_entry_index,
        last_log_entry_term,
    }
}

fn convert_append_entries_input(input: AppendEntriesInput) -> ProtoAppendEntriesReq {
    let commit_index = input.leader_commit_index.map(|ci| ci.as_u64()).unwrap_or(0);

    let (previous_log_entry_term, previous_log_entry_index) = match input.leader_previous_log_entry {
        None => (0, 0),
        Some((term, idx)) => (term.as_u64(), idx.as_u64()),
    };

    let new_entries = input
        .new_entries
        .into_iter()
        .map(|entry| ProtoLogEntry {
            term: entry.term.as_u64(),
            data: entry.payload.to_bytes(),
        })
        .collect();

    ProtoAppendEntriesReq {
        client_node_id: input.leader.replica_id.into_inner(),
        client_node_address: input.leader.raft_address,
        term: input.leader_term.as_u64(),
        commit_index,
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries,
    }
}

fn convert_optional_index(index: u64) -> Option<Index> {
    match index {
        0 => None,
        i => Some(Index::new(i)),
    }
}

#[cfg(test)]
pub(crate) use local_network::LocalNetwork;

/// An in-process network for consensus tests. Each replica registers its actor under its raft
/// address, and any address can be cut off from everybody else.
#[cfg(test)]
mod local_network {
    use super::*;
    use crate::actor::WeakActorClient;
    use crate::replica::{AppendEntriesError, InstallSnapshotError, RequestVoteError};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    pub(crate) struct LocalNetwork {
        inner: Arc<Mutex<Inner>>,
    }

    #[derive(Default)]
    struct Inner {
        replicas: HashMap<String, WeakActorClient>,
        isolated: HashSet<String>,
    }

    impl LocalNetwork {
        pub(crate) fn register(&self, raft_address: &str, actor_client: WeakActorClient) {
            self.lock().replicas.insert(raft_address.to_string(), actor_client);
        }

        pub(crate) fn isolate(&self, raft_address: &str) {
            self.lock().isolated.insert(raft_address.to_string());
        }

        pub(crate) fn heal(&self, raft_address: &str) {
            self.lock().isolated.remove(raft_address);
        }

        pub(crate) fn connector(&self, my_raft_address: &str) -> Arc<dyn PeerConnector> {
            Arc::new(LocalConnector {
                network: self.clone(),
                from: my_raft_address.to_string(),
            })
        }

        fn route(&self, from: &str, to: &str) -> Option<WeakActorClient> {
            let inner = self.lock();
            if inner.isolated.contains(from) || inner.isolated.contains(to) {
                return None;
            }
            inner.replicas.get(to).cloned()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().expect("LocalNetwork mutex guard poison")
        }
    }

    struct LocalConnector {
        network: LocalNetwork,
        from: String,
    }

    impl PeerConnector for LocalConnector {
        fn connect(&self, _peer_id: &ReplicaId, raft_address: &str) -> Arc<dyn PeerClient> {
            Arc::new(LocalPeerClient {
                network: self.network.clone(),
                from: self.from.clone(),
                to: raft_address.to_string(),
            })
        }
    }

    struct LocalPeerClient {
        network: LocalNetwork,
        from: String,
        to: String,
    }

    impl LocalPeerClient {
        fn unreachable(&self) -> AppendEntriesReplyFromPeerError {
            AppendEntriesReplyFromPeerError::RetryableFailure(format!("{} unreachable from {}", self.to, self.from))
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for LocalPeerClient {
        async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult {
            let peer = match self.network.route(&self.from, &self.to) {
                Some(peer) => peer,
                None => return RequestVoteResult::RetryableFailure,
            };
            match peer.request_vote(input).await {
                Ok(output) if output.vote_granted => RequestVoteResult::VoteGranted,
                Ok(_) => RequestVoteResult::VoteNotGranted,
                Err(RequestVoteError::RequestTermOutOfDate(info)) => RequestVoteResult::StaleTerm {
                    new_term: info.current_term,
                },
                Err(RequestVoteError::ServerIoError(_)) | Err(RequestVoteError::ActorExited) => {
                    RequestVoteResult::RetryableFailure
                }
            }
        }

        async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError> {
            let peer = self.network.route(&self.from, &self.to).ok_or_else(|| self.unreachable())?;
            match peer.append_entries(input).await {
                Ok(_) => Ok(()),
                Err(AppendEntriesError::ClientTermOutOfDate(info)) => Err(AppendEntriesReplyFromPeerError::StaleTerm {
                    new_term: info.current_term,
                }),
                Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index })
                }
                Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
            }
        }

        async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), AppendEntriesReplyFromPeerError> {
            let peer = self.network.route(&self.from, &self.to).ok_or_else(|| self.unreachable())?;
            match peer.install_snapshot(input).await {
                Ok(_) => Ok(()),
                Err(InstallSnapshotError::ClientTermOutOfDate(info)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: info.current_term,
                    })
                }
                Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
            }
        }
    }
}
