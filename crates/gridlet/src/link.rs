//! Peer link: pumps an established duplex stream through a proxy.
//!
//! One link per peer pairing. The read loop decodes length-delimited frames
//! and dispatches each on its own task, so a slow collaborator call never
//! head-of-line-blocks the link and replies may complete out of order. The
//! write side is a single task draining a channel of already-encoded frames.
//!
//! Connection establishment, retry, and security are out of scope; the link
//! takes over a stream someone else opened.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LEN, frame_codec};
use crate::manager::{ConnectionWriter, DependencyManager, ModuleManager};
use crate::proxy::Proxy;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Cap on a single inbound or outbound frame.
    pub max_frame_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Channel-backed [`ConnectionWriter`] feeding a link's write task.
///
/// Send failures after link shutdown are swallowed: the contract is
/// fire-and-forget and a dead link looks like network loss.
pub struct LinkWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ConnectionWriter for LinkWriter {
    async fn write(&self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link writer closed"))
    }
}

/// A running link: proxy plus its read/write tasks.
pub struct PeerLink {
    proxy: Arc<Proxy>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl PeerLink {
    /// Take over `stream` and spawn the link tasks.
    pub fn spawn<S>(
        stream: S,
        modules: Arc<dyn ModuleManager>,
        deps: Arc<dyn DependencyManager>,
        config: LinkConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = Arc::new(LinkWriter { tx });
        let proxy = Arc::new(Proxy::new(modules, deps, writer));

        let mut framed_write = FramedWrite::new(write_half, frame_codec(config.max_frame_len));
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = framed_write.send(frame).await {
                    tracing::warn!(error = %e, "peer write failed, stopping link writer");
                    break;
                }
            }
            tracing::trace!("link writer exiting");
        });

        let mut framed_read = FramedRead::new(read_half, frame_codec(config.max_frame_len));
        let read_proxy = Arc::clone(&proxy);
        let read_task = tokio::spawn(async move {
            while let Some(next) = framed_read.next().await {
                match next {
                    Ok(payload) => {
                        // Per-frame task: replies go out whenever the
                        // collaborator settles, not in arrival order.
                        let proxy = Arc::clone(&read_proxy);
                        tokio::spawn(async move {
                            proxy.process_frame(&payload).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "peer read failed, closing link");
                        break;
                    }
                }
            }
            tracing::debug!("peer link closed");
        });

        Self {
            proxy,
            read_task,
            write_task,
        }
    }

    /// The proxy bound to this link.
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Wait for the peer to close the stream, then stop the writer.
    ///
    /// Requests still pending at that point stay pending; timeout policy
    /// belongs to the layer above.
    pub async fn closed(self) {
        let _ = self.read_task.await;
        self.write_task.abort();
        let _ = self.write_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ManagerError, ModuleHandle};
    use crate::proxy::ProxyError;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    struct NullDeps;

    #[async_trait]
    impl DependencyManager for NullDeps {
        async fn load(&self, dep: &str, _force: bool) -> Result<(), ManagerError> {
            Err(ManagerError::new(format!("unknown dependency {dep}")))
        }
    }

    struct Doubler;

    #[async_trait]
    impl ModuleHandle for Doubler {
        async fn invoke(&self, func: &str, args: Vec<Value>) -> Result<Value, ManagerError> {
            match func {
                "double" => {
                    let n = args
                        .first()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| ManagerError::new("expected one integer"))?;
                    Ok(json!(n * 2))
                }
                other => Err(ManagerError::new(format!("no such function: {other}"))),
            }
        }
    }

    #[derive(Default)]
    struct NodeModules {
        loaded: Vec<String>,
        statuses: Mutex<HashMap<(String, String), Value>>,
        expired: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl ModuleManager for NodeModules {
        fn lookup(&self, module: &str) -> Option<Arc<dyn ModuleHandle>> {
            self.loaded
                .iter()
                .any(|m| m == module)
                .then(|| Arc::new(Doubler) as Arc<dyn ModuleHandle>)
        }

        fn read_status(&self, module: &str, stat: &str) -> Value {
            self.statuses
                .lock()
                .unwrap()
                .get(&(module.to_string(), stat.to_string()))
                .cloned()
                .unwrap_or(Value::Null)
        }

        fn write_status(&self, module: &str, stat: &str, val: Value, _remote: bool) -> Value {
            self.statuses
                .lock()
                .unwrap()
                .insert((module.to_string(), stat.to_string()), val.clone());
            val
        }

        async fn start(&self, _module: &str, _remote: bool) -> Result<bool, ManagerError> {
            Ok(true)
        }

        async fn stop(&self, _module: &str, _remote: bool) -> Result<bool, ManagerError> {
            Ok(true)
        }

        async fn unload(&self, _module: &str, _remote: bool) -> Result<bool, ManagerError> {
            Ok(true)
        }

        async fn update(&self, _module: &str, _remote: bool) -> Result<bool, ManagerError> {
            Ok(true)
        }

        async fn expire_cache(&self, sys: &str, remote: bool) -> Result<(), ManagerError> {
            self.expired.lock().unwrap().push((sys.to_string(), remote));
            Ok(())
        }
    }

    fn linked_pair(remote_modules: NodeModules) -> (PeerLink, PeerLink, Arc<NodeModules>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let remote_modules = Arc::new(remote_modules);

        let local = PeerLink::spawn(
            near,
            Arc::new(NodeModules::default()) as Arc<dyn ModuleManager>,
            Arc::new(NullDeps),
            LinkConfig::default(),
        );
        let remote = PeerLink::spawn(
            far,
            Arc::clone(&remote_modules) as Arc<dyn ModuleManager>,
            Arc::new(NullDeps),
            LinkConfig::default(),
        );
        (local, remote, remote_modules)
    }

    async fn settle(reply: crate::correlation::ReplyFuture) -> crate::correlation::ReplyResult {
        timeout(Duration::from_secs(5), reply)
            .await
            .expect("reply did not settle")
    }

    #[tokio::test]
    async fn execute_round_trips_across_a_link() {
        let (local, _remote, _) = linked_pair(NodeModules {
            loaded: vec!["mod_111".into()],
            ..NodeModules::default()
        });

        let reply = local.proxy().execute("mod_111", "double", json!([21])).await;
        assert_eq!(settle(reply).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn execute_rejection_crosses_the_link() {
        let (local, _remote, _) = linked_pair(NodeModules::default());

        let reply = local.proxy().execute("mod_404", "double", json!([1])).await;
        match settle(reply).await {
            Err(ProxyError::Rejected(detail)) => assert_eq!(detail, "module not loaded"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_write_and_read_across_a_link() {
        let (local, _remote, remote_modules) = linked_pair(NodeModules::default());

        let wrote = local
            .proxy()
            .set_status("mod_111", "level", json!([10, 20]))
            .await;
        assert_eq!(settle(wrote).await.unwrap(), json!(true));
        assert_eq!(
            remote_modules.read_status("mod_111", "level"),
            json!([10, 20])
        );

        let read = local.proxy().status("mod_111", "level").await;
        assert_eq!(settle(read).await.unwrap(), json!([10, 20]));
    }

    #[tokio::test]
    async fn expire_cache_crosses_the_link_marked_local() {
        let (local, _remote, remote_modules) = linked_pair(NodeModules::default());

        let reply = local.proxy().expire_cache("sys_9").await;
        assert_eq!(settle(reply).await.unwrap(), json!(true));
        assert_eq!(
            remote_modules.expired.lock().unwrap().clone(),
            vec![("sys_9".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn reload_rejection_uses_dependency_detail() {
        let (local, _remote, _) = linked_pair(NodeModules::default());

        let reply = local.proxy().reload("ghost_dep").await;
        match settle(reply).await {
            Err(ProxyError::Rejected(detail)) => {
                assert_eq!(detail, "dependency ghost_dep not found");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_settle_independently() {
        let (local, _remote, _) = linked_pair(NodeModules {
            loaded: vec!["mod_a".into()],
            ..NodeModules::default()
        });

        let hit = local.proxy().execute("mod_a", "double", json!([5])).await;
        let miss = local.proxy().execute("mod_b", "double", json!([5])).await;
        let lifecycle = local.proxy().start("mod_a").await;

        assert_eq!(settle(hit).await.unwrap(), json!(10));
        assert!(matches!(settle(miss).await, Err(ProxyError::Rejected(_))));
        assert_eq!(settle(lifecycle).await.unwrap(), json!(true));
        assert_eq!(local.proxy().outstanding(), 0);
    }

    #[tokio::test]
    async fn dropped_peer_leaves_request_pending() {
        let (local, remote, _) = linked_pair(NodeModules::default());

        // Kill the remote end before it can answer.
        remote.read_task.abort();
        remote.write_task.abort();
        drop(remote);

        let reply = local.proxy().execute("mod_111", "double", json!([1])).await;
        assert!(
            timeout(Duration::from_millis(200), reply).await.is_err(),
            "request must stay pending with no peer response"
        );
        assert_eq!(local.proxy().outstanding(), 1);

        // The local link observes the closed stream and winds down.
        timeout(Duration::from_secs(5), local.closed())
            .await
            .expect("link did not close");
    }
}
