mod actor;
mod api;
mod commitlog;
mod kv;
mod replica;
mod server;
mod snapshot;
mod state_machine;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_node;
pub use api::ElectionEvent;
pub use api::Event;
pub use api::EventListener;
pub use api::FollowerEventData;
pub use api::KvClient;
pub use api::KvClientError;
pub use api::NodeCreationError;
pub use api::NodeStatus;
pub use api::ProposeError;
pub use api::RaftKvConfig;
pub use api::RaftKvNode;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftOptions;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
