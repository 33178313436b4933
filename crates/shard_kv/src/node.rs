//! Node assembly: storage, AOF, coordinator, and the Redis listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::aof::AofHandler;
use crate::cluster::{ClusterDatabase, Router};
use crate::config::Config;
use crate::database::MemoryDatabase;
use crate::redis_server;

/// One shard_kv member: the coordinator plus the AOF feeding its database.
pub struct Node {
    cluster: Arc<ClusterDatabase>,
    aof: Option<Arc<AofHandler>>,
}

impl Node {
    /// Build the node and replay the AOF. Nothing listens yet.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_with_router(config, Router::cluster_default()).await
    }

    /// Same as [`Node::open`] with a caller-supplied command table.
    pub async fn open_with_router(config: &Config, router: Router) -> anyhow::Result<Self> {
        let db = Arc::new(MemoryDatabase::new(config.databases));
        let aof = if config.aof.enabled {
            let aof = AofHandler::open(config.aof.clone(), db.as_ref())
                .await
                .context("open append-only file")?;
            db.attach_aof(aof.clone());
            Some(aof)
        } else {
            None
        };
        let cluster = Arc::new(ClusterDatabase::new(config, db, Arc::new(router)));
        Ok(Self { cluster, aof })
    }

    pub fn cluster(&self) -> &Arc<ClusterDatabase> {
        &self.cluster
    }

    pub fn aof(&self) -> Option<&Arc<AofHandler>> {
        self.aof.as_ref()
    }

    /// Serve clients until `shutdown` resolves, then close the coordinator
    /// (draining the AOF and peer pools).
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let served = redis_server::serve(listener, self.cluster.clone(), shutdown).await;
        self.cluster.close().await;
        tracing::info!("node stopped");
        served
    }
}

/// Run a node until ctrl-c.
pub async fn run_node(config: Config) -> anyhow::Result<()> {
    run_node_with_shutdown(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = ?err, "ctrl-c handler failed");
        }
    })
    .await
}

/// Run a node until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let node = Node::open(&config).await?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind redis listener {}", config.listen))?;
    tracing::info!(
        listen = %listener.local_addr()?,
        self_id = %config.self_id,
        peers = config.peers.len(),
        appendonly = config.aof.enabled,
        "node ready"
    );
    node.serve(listener, shutdown).await
}

/// A node running on a background task.
pub struct NodeHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl NodeHandle {
    /// Address the Redis listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close the node, and wait for it.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("shard_kv node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start a node in the background. The listener is bound before this
/// returns, so clients can connect right away.
pub async fn start_node(config: Config) -> anyhow::Result<NodeHandle> {
    start_node_with_router(config, Router::cluster_default()).await
}

pub async fn start_node_with_router(config: Config, router: Router) -> anyhow::Result<NodeHandle> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind redis listener {}", config.listen))?;
    let local_addr = listener.local_addr()?;
    let node = Node::open_with_router(&config, router).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(node.serve(listener, async move {
        let _ = shutdown_rx.await;
    }));
    Ok(NodeHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}
