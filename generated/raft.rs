#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    /// 0 means the candidate's log is empty.
    #[prost(uint64, tag = "3")]
    pub last_log_entry_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_entry_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteResult {
    #[prost(oneof = "proto_request_vote_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_request_vote_result::Result>,
}
/// Nested message and enum types in `ProtoRequestVoteResult`.
pub mod proto_request_vote_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoRequestVoteSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoRequestVoteError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteSuccess {
    #[prost(bool, tag = "1")]
    pub vote_granted: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteError {
    #[prost(oneof = "proto_request_vote_error::Err", tags = "1, 2")]
    pub err: ::core::option::Option<proto_request_vote_error::Err>,
}
/// Nested message and enum types in `ProtoRequestVoteError`.
pub mod proto_request_vote_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub client_node_address: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(uint64, tag = "4")]
    pub commit_index: u64,
    #[prost(uint64, tag = "5")]
    pub previous_log_entry_term: u64,
    #[prost(uint64, tag = "6")]
    pub previous_log_entry_index: u64,
    #[prost(message, repeated, tag = "7")]
    pub new_entries: ::prost::alloc::vec::Vec<ProtoLogEntry>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// Kind-tagged payload, see `EntryPayload`.
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResult {
    #[prost(oneof = "proto_append_entries_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_append_entries_result::Result>,
}
/// Nested message and enum types in `ProtoAppendEntriesResult`.
pub mod proto_append_entries_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoAppendEntriesSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoAppendEntriesError),
    }
}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesSuccess {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesError {
    #[prost(oneof = "proto_append_entries_error::Err", tags = "1, 2, 3")]
    pub err: ::core::option::Option<proto_append_entries_error::Err>,
}
/// Nested message and enum types in `ProtoAppendEntriesError`.
pub mod proto_append_entries_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        MissingLog(super::ProtoServerMissingPreviousLog),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerFault {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientStaleTerm {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerMissingPreviousLog {
    /// Index of the last entry the server has. 0 if its log is empty.
    #[prost(uint64, tag = "1")]
    pub last_log_index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub client_node_address: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(message, optional, tag = "4")]
    pub snapshot: ::core::option::Option<ProtoSnapshot>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResult {
    #[prost(oneof = "proto_install_snapshot_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_install_snapshot_result::Result>,
}
/// Nested message and enum types in `ProtoInstallSnapshotResult`.
pub mod proto_install_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoInstallSnapshotSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoInstallSnapshotError),
    }
}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotSuccess {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotError {
    #[prost(oneof = "proto_install_snapshot_error::Err", tags = "1, 2")]
    pub err: ::core::option::Option<proto_install_snapshot_error::Err>,
}
/// Nested message and enum types in `ProtoInstallSnapshotError`.
pub mod proto_install_snapshot_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
    }
}
// ---------------------------------------------------------------------------
// Persisted and replicated payloads.
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoMember {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoMembership {
    #[prost(message, repeated, tag = "1")]
    pub voters: ::prost::alloc::vec::Vec<ProtoMember>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHardState {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    /// Empty string means no vote this term.
    #[prost(string, tag = "2")]
    pub voted_for: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshot {
    #[prost(uint64, tag = "1")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "2")]
    pub last_included_term: u64,
    #[prost(message, optional, tag = "3")]
    pub membership: ::core::option::Option<ProtoMembership>,
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "5")]
    pub created_at_millis: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKvSet {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKvCommand {
    #[prost(oneof = "proto_kv_command::Op", tags = "1")]
    pub op: ::core::option::Option<proto_kv_command::Op>,
}
/// Nested message and enum types in `ProtoKvCommand`.
pub mod proto_kv_command {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        #[prost(message, tag = "1")]
        Set(super::ProtoKvSet),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoCacheImage {
    #[prost(map = "string, string", tag = "1")]
    pub entries:
        ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoGetReq {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoGetResult {
    /// Empty string if the key is absent.
    #[prost(string, tag = "1")]
    pub value: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSetReq {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoJoinReq {
    #[prost(string, tag = "1")]
    pub peer_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub peer_address: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRemoveReq {
    #[prost(string, tag = "1")]
    pub peer_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKvResult {
    #[prost(oneof = "proto_kv_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_kv_result::Result>,
}
/// Nested message and enum types in `ProtoKvResult`.
pub mod proto_kv_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoKvSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoKvError),
    }
}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKvSuccess {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoKvError {
    #[prost(oneof = "proto_kv_error::Err", tags = "1, 2, 3, 4")]
    pub err: ::core::option::Option<proto_kv_error::Err>,
}
/// Nested message and enum types in `ProtoKvError`.
pub mod proto_kv_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        NotLeader(super::ProtoNotLeader),
        #[prost(message, tag = "2")]
        Timeout(super::ProtoCommitTimeout),
        #[prost(message, tag = "3")]
        Internal(super::ProtoServerFault),
        #[prost(message, tag = "4")]
        MembershipConflict(super::ProtoMembershipConflict),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNotLeader {
    /// Empty if the leader is unknown.
    #[prost(string, tag = "1")]
    pub leader_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub leader_address: ::prost::alloc::string::String,
}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoCommitTimeout {}
/// Empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoMembershipConflict {}
#[doc = r" Generated client implementations."]
pub mod grpc_raft_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    pub struct GrpcRaftClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl GrpcRaftClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> GrpcRaftClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn request_vote(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/RequestVote");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn append_entries(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/AppendEntries");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn install_snapshot(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcRaft/InstallSnapshot");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for GrpcRaftClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for GrpcRaftClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GrpcRaftClient {{ ... }}")
        }
    }
}
#[doc = r" Generated client implementations."]
pub mod grpc_kv_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    pub struct GrpcKvClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl GrpcKvClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> GrpcKvClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn get(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoGetReq>,
        ) -> Result<tonic::Response<super::ProtoGetResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcKv/Get");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn set(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoSetReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcKv/Set");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn join(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoJoinReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcKv/Join");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn remove(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoRemoveReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/raft.GrpcKv/Remove");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for GrpcKvClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for GrpcKvClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GrpcKvClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod grpc_raft_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcRaftServer."]
    #[async_trait]
    pub trait GrpcRaft: Send + Sync + 'static {
        async fn request_vote(
            &self,
            request: tonic::Request<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status>;
        async fn append_entries(
            &self,
            request: tonic::Request<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status>;
        async fn install_snapshot(
            &self,
            request: tonic::Request<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct GrpcRaftServer<T: GrpcRaft> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: GrpcRaft> GrpcRaftServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for GrpcRaftServer<T>
    where
        T: GrpcRaft,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/raft.GrpcRaft/RequestVote" => {
                    #[allow(non_camel_case_types)]
                    struct RequestVoteSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoRequestVoteReq> for RequestVoteSvc<T> {
                        type Response = super::ProtoRequestVoteResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoRequestVoteReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).request_vote(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = RequestVoteSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/raft.GrpcRaft/AppendEntries" => {
                    #[allow(non_camel_case_types)]
                    struct AppendEntriesSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoAppendEntriesReq>
                        for AppendEntriesSvc<T>
                    {
                        type Response = super::ProtoAppendEntriesResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoAppendEntriesReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).append_entries(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = AppendEntriesSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/raft.GrpcRaft/InstallSnapshot" => {
                    #[allow(non_camel_case_types)]
                    struct InstallSnapshotSvc<T: GrpcRaft>(pub Arc<T>);
                    impl<T: GrpcRaft> tonic::server::UnaryService<super::ProtoInstallSnapshotReq>
                        for InstallSnapshotSvc<T>
                    {
                        type Response = super::ProtoInstallSnapshotResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoInstallSnapshotReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).install_snapshot(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = InstallSnapshotSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: GrpcRaft> Clone for GrpcRaftServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: GrpcRaft> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: GrpcRaft> tonic::transport::NamedService for GrpcRaftServer<T> {
        const NAME: &'static str = "raft.GrpcRaft";
    }
}
#[doc = r" Generated server implementations."]
pub mod grpc_kv_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcKvServer."]
    #[async_trait]
    pub trait GrpcKv: Send + Sync + 'static {
        async fn get(
            &self,
            request: tonic::Request<super::ProtoGetReq>,
        ) -> Result<tonic::Response<super::ProtoGetResult>, tonic::Status>;
        async fn set(
            &self,
            request: tonic::Request<super::ProtoSetReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status>;
        async fn join(
            &self,
            request: tonic::Request<super::ProtoJoinReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status>;
        async fn remove(
            &self,
            request: tonic::Request<super::ProtoRemoveReq>,
        ) -> Result<tonic::Response<super::ProtoKvResult>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct GrpcKvServer<T: GrpcKv> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: GrpcKv> GrpcKvServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for GrpcKvServer<T>
    where
        T: GrpcKv,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/raft.GrpcKv/Get" => {
                    #[allow(non_camel_case_types)]
                    struct GetSvc<T: GrpcKv>(pub Arc<T>);
                    impl<T: GrpcKv> tonic::server::UnaryService<super::ProtoGetReq> for GetSvc<T> {
                        type Response = super::ProtoGetResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoGetReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).get(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = GetSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/raft.GrpcKv/Set" => {
                    #[allow(non_camel_case_types)]
                    struct SetSvc<T: GrpcKv>(pub Arc<T>);
                    impl<T: GrpcKv> tonic::server::UnaryService<super::ProtoSetReq> for SetSvc<T> {
                        type Response = super::ProtoKvResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoSetReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).set(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = SetSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/raft.GrpcKv/Join" => {
                    #[allow(non_camel_case_types)]
                    struct JoinSvc<T: GrpcKv>(pub Arc<T>);
                    impl<T: GrpcKv> tonic::server::UnaryService<super::ProtoJoinReq> for JoinSvc<T> {
                        type Response = super::ProtoKvResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoJoinReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).join(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = JoinSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/raft.GrpcKv/Remove" => {
                    #[allow(non_camel_case_types)]
                    struct RemoveSvc<T: GrpcKv>(pub Arc<T>);
                    impl<T: GrpcKv> tonic::server::UnaryService<super::ProtoRemoveReq> for RemoveSvc<T> {
                        type Response = super::ProtoKvResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoRemoveReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).remove(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = RemoveSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: GrpcKv> Clone for GrpcKvServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: GrpcKv> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: GrpcKv> tonic::transport::NamedService for GrpcKvServer<T> {
        const NAME: &'static str = "raft.GrpcKv";
    }
}
