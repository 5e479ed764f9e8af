//! Collaborator contracts consumed by the proxy.
//!
//! The proxy never performs lifecycle, status, or dependency work itself; it
//! dispatches to these traits. Every mutating call carries an explicit
//! `remote` flag: `true` permits the collaborator to forward the operation to
//! the owning peer, `false` forces local handling. The dispatcher always
//! passes `false` so a request serviced on behalf of a peer can never hop to
//! a third node.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::bytes::Bytes;

/// Failure raised by a collaborator while servicing a request.
///
/// The display string is carried verbatim as the `reject` detail on the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ManagerError {
    message: String,
}

impl ManagerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A resolved local module instance.
#[async_trait]
pub trait ModuleHandle: Send + Sync {
    /// Invoke `func` with an ordered argument list on this instance.
    async fn invoke(&self, func: &str, args: Vec<Value>) -> Result<Value, ManagerError>;
}

/// Local module lifecycle, status, and cache operations.
#[async_trait]
pub trait ModuleManager: Send + Sync {
    /// Resolve a running local instance, if this node has one.
    fn lookup(&self, module: &str) -> Option<Arc<dyn ModuleHandle>>;

    /// Read one key from a module's status table.
    fn read_status(&self, module: &str, stat: &str) -> Value;

    /// Write one status key, returning the stored value.
    fn write_status(&self, module: &str, stat: &str, val: Value, remote: bool) -> Value;

    async fn start(&self, module: &str, remote: bool) -> Result<bool, ManagerError>;

    async fn stop(&self, module: &str, remote: bool) -> Result<bool, ManagerError>;

    async fn unload(&self, module: &str, remote: bool) -> Result<bool, ManagerError>;

    /// Refresh a running instance in place. Services inbound `push: load`
    /// frames; distinct from [`ModuleManager::unload`].
    async fn update(&self, module: &str, remote: bool) -> Result<bool, ManagerError>;

    /// Invalidate cached state for a control system.
    async fn expire_cache(&self, sys: &str, remote: bool) -> Result<(), ManagerError>;
}

/// Resolution and hot-reload of driver implementation classes.
#[async_trait]
pub trait DependencyManager: Send + Sync {
    /// Resolve the backing class for `dep`, force-reloading when asked.
    /// `Err` means the class cannot be resolved.
    async fn load(&self, dep: &str, force: bool) -> Result<(), ManagerError>;
}

/// Outbound transport seam: accepts a fully-encoded frame for transmission.
///
/// Fire-and-forget from the proxy's point of view: a write error is
/// indistinguishable from network loss and is not surfaced to callers.
#[async_trait]
pub trait ConnectionWriter: Send + Sync {
    async fn write(&self, frame: Bytes) -> io::Result<()>;
}
