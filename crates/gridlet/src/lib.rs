//! gridlet: inter-node RPC proxy for clustered module orchestration.
//!
//! A fleet of nodes each own a disjoint set of running modules; any node may
//! invoke operations on, or query status of, a module owned by a peer. The
//! [`Proxy`] turns local calls into correlated wire requests, inbound
//! requests into collaborator dispatch, and inbound responses into settlement
//! of previously issued reply futures.

pub mod bridge;
pub mod correlation;
pub mod link;
pub mod manager;
pub mod proxy;

pub use bridge::protocol::{Message, Outcome, PushOp};
pub use correlation::{PendingTable, ReplyFuture, ReplyResult};
pub use link::{LinkConfig, LinkWriter, PeerLink};
pub use manager::{
    ConnectionWriter, DependencyManager, ManagerError, ModuleHandle, ModuleManager,
};
pub use proxy::{Proxy, ProxyError};
