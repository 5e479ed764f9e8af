//! The proxy core: turns local calls into correlated wire requests, inbound
//! requests into collaborator dispatch, and inbound responses into settlement
//! of previously issued reply futures.
//!
//! One proxy per peer pairing. Ids are a per-instance counter, unique only
//! among this proxy's outstanding requests; frames are demultiplexed per
//! logical connection, not globally.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::bridge::codec;
use crate::bridge::protocol::{Message, Outcome, PushOp};
use crate::correlation::{PendingTable, ReplyFuture};
use crate::manager::{ConnectionWriter, DependencyManager, ManagerError, ModuleManager};

/// Failure surfaced on a [`ReplyFuture`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The peer's dispatcher could not satisfy the request; carries the
    /// peer's exact error string.
    #[error("{0}")]
    Rejected(String),

    /// Pre-flight validation failed: the value cannot be represented in the
    /// wire codec's value domain. No frame was produced.
    #[error("value not representable on the wire: {0}")]
    Unrepresentable(#[from] serde_json::Error),

    /// The proxy was dropped with the request still outstanding.
    #[error("proxy dropped before a reply arrived")]
    Abandoned,
}

/// Inter-node RPC proxy for one peer pairing.
pub struct Proxy {
    next_id: AtomicU64,
    pending: PendingTable,
    modules: Arc<dyn ModuleManager>,
    deps: Arc<dyn DependencyManager>,
    writer: Arc<dyn ConnectionWriter>,
}

impl Proxy {
    pub fn new(
        modules: Arc<dyn ModuleManager>,
        deps: Arc<dyn DependencyManager>,
        writer: Arc<dyn ConnectionWriter>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: PendingTable::new(),
            modules,
            deps,
            writer,
        }
    }

    /// Number of requests still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    // ---- outward operations -------------------------------------------------

    /// Invoke `func` with an ordered argument list on a module owned by the
    /// peer. `args` must serialize to a sequence.
    pub async fn execute(
        &self,
        module: &str,
        func: &str,
        args: impl Serialize,
    ) -> ReplyFuture {
        let args = match codec::wire_args(args) {
            Ok(args) => args,
            Err(e) => return ReplyFuture::failed(ProxyError::Unrepresentable(e)),
        };
        let id = self.allocate_id();
        let message = Message::Cmd {
            module: module.to_string(),
            func: func.to_string(),
            args,
            id: id.clone(),
        };
        self.send_request(message, &id).await
    }

    /// Read status key `stat` on a module owned by the peer.
    pub async fn status(&self, module: &str, stat: &str) -> ReplyFuture {
        let id = self.allocate_id();
        let message = Message::Stat {
            module: module.to_string(),
            stat: stat.to_string(),
            id: id.clone(),
        };
        self.send_request(message, &id).await
    }

    /// Write a status key on a module owned by the peer.
    ///
    /// `val` is validated against the wire value domain before any frame is
    /// built; on failure the returned future is already rejected and nothing
    /// is written to the connection.
    pub async fn set_status(
        &self,
        module: &str,
        stat: &str,
        val: impl Serialize,
    ) -> ReplyFuture {
        let val = match codec::wire_value(val) {
            Ok(val) => val,
            Err(e) => return ReplyFuture::failed(ProxyError::Unrepresentable(e)),
        };
        self.push(PushOp::Status {
            module: module.to_string(),
            stat: stat.to_string(),
            val,
        })
        .await
    }

    pub async fn start(&self, module: &str) -> ReplyFuture {
        self.push(PushOp::Start {
            module: module.to_string(),
        })
        .await
    }

    pub async fn stop(&self, module: &str) -> ReplyFuture {
        self.push(PushOp::Stop {
            module: module.to_string(),
        })
        .await
    }

    /// Ask the peer to refresh a running instance in place (serviced remotely
    /// by the update lifecycle operation).
    pub async fn load(&self, module: &str) -> ReplyFuture {
        self.push(PushOp::Load {
            module: module.to_string(),
        })
        .await
    }

    pub async fn unload(&self, module: &str) -> ReplyFuture {
        self.push(PushOp::Unload {
            module: module.to_string(),
        })
        .await
    }

    /// Force-reload dependency `dep`'s backing class on the peer.
    pub async fn reload(&self, dep: &str) -> ReplyFuture {
        self.push(PushOp::Reload {
            dep: dep.to_string(),
        })
        .await
    }

    /// Invalidate the peer's cached state for control system `sys`.
    ///
    /// Deciding *which* peers own a control system's zones is the engine
    /// layer's job; it calls this once per relevant peer proxy.
    pub async fn expire_cache(&self, sys: &str) -> ReplyFuture {
        let id = self.allocate_id();
        let message = Message::Expire {
            sys: sys.to_string(),
            id: id.clone(),
        };
        self.send_request(message, &id).await
    }

    // ---- inbound dispatch ---------------------------------------------------

    /// Single entry point for every inbound frame, request or response.
    ///
    /// Never fails outward: collaborator errors become reject replies, and a
    /// response with no matching pending entry is dropped silently.
    pub async fn process(&self, message: Message) {
        match message {
            Message::Resp { id, outcome } => {
                let result = match outcome {
                    Outcome::Resolve(value) => Ok(value),
                    Outcome::Reject(detail) => Err(ProxyError::Rejected(detail)),
                };
                if !self.pending.settle(&id, result) {
                    tracing::debug!(%id, "response with no pending request, dropping");
                }
            }
            Message::Cmd {
                module,
                func,
                args,
                id,
            } => {
                let outcome = self.dispatch_cmd(&module, &func, args).await;
                self.reply(id, outcome).await;
            }
            Message::Stat { module, stat, id } => {
                let value = self.modules.read_status(&module, &stat);
                self.reply(id, Outcome::Resolve(value)).await;
            }
            Message::Push { op, id } => {
                let outcome = self.dispatch_push(op).await;
                self.reply(id, outcome).await;
            }
            Message::Expire { sys, id } => {
                let outcome = match self.modules.expire_cache(&sys, false).await {
                    Ok(()) => Outcome::resolved_true(),
                    Err(e) => Outcome::Reject(e.to_string()),
                };
                self.reply(id, outcome).await;
            }
        }
    }

    /// Decode-and-dispatch entry point used by the link layer.
    ///
    /// A payload that is well-formed JSON but not a recognized message shape
    /// gets a defined reject reply when an id can still be recovered;
    /// anything else is dropped.
    pub async fn process_frame(&self, payload: &[u8]) {
        match codec::decode(payload) {
            Ok(message) => self.process(message).await,
            Err(decode_err) => {
                if let Some(id) = salvage_id(payload) {
                    tracing::debug!(%id, error = %decode_err, "unrecognized message, rejecting");
                    self.reply(id, Outcome::Reject("unrecognized message".to_string()))
                        .await;
                } else {
                    tracing::debug!(error = %decode_err, "undecodable frame dropped");
                }
            }
        }
    }

    async fn dispatch_cmd(&self, module: &str, func: &str, args: Vec<Value>) -> Outcome {
        let Some(handle) = self.modules.lookup(module) else {
            return Outcome::Reject("module not loaded".to_string());
        };
        match handle.invoke(func, args).await {
            Ok(value) => Outcome::Resolve(value),
            Err(e) => Outcome::Reject(e.to_string()),
        }
    }

    async fn dispatch_push(&self, op: PushOp) -> Outcome {
        match op {
            PushOp::Status { module, stat, val } => {
                self.modules.write_status(&module, &stat, val, false);
                Outcome::resolved_true()
            }
            PushOp::Start { module } => lifecycle(self.modules.start(&module, false).await),
            PushOp::Stop { module } => lifecycle(self.modules.stop(&module, false).await),
            // An inbound load means "refresh in place", not unload.
            PushOp::Load { module } => lifecycle(self.modules.update(&module, false).await),
            PushOp::Unload { module } => lifecycle(self.modules.unload(&module, false).await),
            PushOp::Reload { dep } => match self.deps.load(&dep, true).await {
                Ok(()) => Outcome::resolved_true(),
                Err(e) => {
                    tracing::debug!(%dep, error = %e, "dependency reload failed");
                    Outcome::Reject(format!("dependency {dep} not found"))
                }
            },
        }
    }

    // ---- plumbing -----------------------------------------------------------

    async fn push(&self, op: PushOp) -> ReplyFuture {
        let id = self.allocate_id();
        let message = Message::Push {
            op,
            id: id.clone(),
        };
        self.send_request(message, &id).await
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_request(&self, message: Message, id: &str) -> ReplyFuture {
        let reply = self.pending.register(id);
        self.write_message(&message).await;
        reply
    }

    async fn reply(&self, id: String, outcome: Outcome) {
        if outcome.is_reject() {
            tracing::trace!(%id, "rejecting inbound request");
        }
        self.write_message(&Message::Resp { id, outcome }).await;
    }

    async fn write_message(&self, message: &Message) {
        match codec::encode(message) {
            Ok(frame) => {
                // Fire-and-forget: a failed write looks the same as network
                // loss, and the pending entry simply stays unsettled.
                if let Err(e) = self.writer.write(frame).await {
                    tracing::warn!(error = %e, "peer write failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "frame encoding failed"),
        }
    }
}

fn lifecycle(result: Result<bool, ManagerError>) -> Outcome {
    match result {
        Ok(_) => Outcome::resolved_true(),
        Err(e) => Outcome::Reject(e.to_string()),
    }
}

fn salvage_id(payload: &[u8]) -> Option<String> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            _ => None,
        },
        _ => None,
    }
}
