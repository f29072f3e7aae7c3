mod kv_service;
mod server;
mod shutdown;

pub(crate) use kv_service::KvService;
pub(crate) use server::RpcServer;
pub(crate) use shutdown::shutdown_signal;
pub(crate) use shutdown::ShutdownHandle;
pub(crate) use shutdown::ShutdownSignal;
