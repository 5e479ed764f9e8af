//! Correlation of outstanding requests to their eventual responses.
//!
//! Each proxy owns one [`PendingTable`] mapping request ids to single-use
//! settlement handles. Settlement removes the entry and fires the handle in
//! one step, with no await point between them, so no caller can observe a
//! resolved-but-still-pending state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::proxy::ProxyError;

/// What a settled request yields: the peer's resolve value, or an error.
pub type ReplyResult = Result<Value, ProxyError>;

/// Pending requests keyed by correlation id.
///
/// Entries persist until a matching response settles them: there is no
/// timeout at this layer, so a peer that never answers leaves the entry in
/// place for the table's lifetime.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, oneshot::Sender<ReplyResult>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request, returning the future its caller awaits.
    pub fn register(&self, id: &str) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        ReplyFuture { rx }
    }

    /// Settle the entry for `id`, removing it. Returns false when no entry
    /// matched (already settled or never registered) — the caller drops the
    /// response silently in that case.
    pub fn settle(&self, id: &str, result: ReplyResult) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        // The receiver may already be gone; the entry is consumed either way.
        let _ = tx.send(result);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ReplyResult>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            // Entries stay valid across a panic elsewhere; keep serving them.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Future returned by every outward proxy operation.
///
/// Settles exactly once, when a matching response is processed. A proxy
/// dropped with the request still outstanding yields [`ProxyError::Abandoned`].
pub struct ReplyFuture {
    rx: oneshot::Receiver<ReplyResult>,
}

impl ReplyFuture {
    /// A future that is already settled. Used for synchronous pre-flight
    /// failures where no frame is ever produced.
    pub(crate) fn settled(result: ReplyResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub(crate) fn failed(err: ProxyError) -> Self {
        Self::settled(Err(err))
    }
}

impl Future for ReplyFuture {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProxyError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_settle_resolves() {
        let table = PendingTable::new();
        let reply = table.register("1");
        assert_eq!(table.len(), 1);

        assert!(table.settle("1", Ok(json!("done"))));
        assert!(table.is_empty());
        assert_eq!(reply.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn settle_carries_rejection() {
        let table = PendingTable::new();
        let reply = table.register("2");
        assert!(table.settle("2", Err(ProxyError::Rejected("nope".into()))));

        match reply.await {
            Err(ProxyError::Rejected(detail)) => assert_eq!(detail, "nope"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn settle_unknown_id_is_noop() {
        let table = PendingTable::new();
        assert!(!table.settle("99", Ok(json!(true))));
    }

    #[test]
    fn settle_is_single_shot() {
        let table = PendingTable::new();
        let _reply = table.register("3");
        assert!(table.settle("3", Ok(json!(1))));
        assert!(!table.settle("3", Ok(json!(2))));
    }

    #[tokio::test]
    async fn dropped_table_abandons_waiters() {
        let table = PendingTable::new();
        let reply = table.register("4");
        drop(table);

        assert!(matches!(reply.await, Err(ProxyError::Abandoned)));
    }

    #[tokio::test]
    async fn pre_settled_future_is_immediate() {
        let reply = ReplyFuture::failed(ProxyError::Abandoned);
        assert!(matches!(reply.await, Err(ProxyError::Abandoned)));
    }
}
