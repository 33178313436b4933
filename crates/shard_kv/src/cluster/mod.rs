//! Cluster coordinator: routes each command to the node owning its keys.
//!
//! Membership is static for the lifetime of the process: the local node plus
//! the configured peers. Every node builds the same [`HashRing`] from that
//! list, so any node can answer for any key by relaying to its owner.

mod relay;
mod router;

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use redis_protocol::resp2::types::BytesFrame;

use crate::client::PeerConnectionFactory;
use crate::config::Config;
use crate::connection::Connection;
use crate::database::Database;
use crate::pool::{Pool, PoolStats};
use crate::protocol::{
    arity_error_reply, command_name, error_reply, unknown_error_reply, CmdLine,
};
use crate::ring::HashRing;

pub use router::{CmdFunc, Router};

/// Prefix on commands relayed between nodes. The receiving node runs the
/// wrapped command on its own database without routing it again.
pub const RELAYED_COMMAND: &str = "_relayed";

/// Coordinator for one node: owns membership, the ring, one connection pool
/// per peer, and the local database every relayed command ends up in.
pub struct ClusterDatabase {
    self_id: String,
    nodes: Vec<String>,
    ring: HashRing,
    peers: HashMap<String, Pool<PeerConnectionFactory>>,
    db: Arc<dyn Database>,
    router: Arc<Router>,
}

impl ClusterDatabase {
    pub fn new(config: &Config, db: Arc<dyn Database>, router: Arc<Router>) -> Self {
        let mut nodes: Vec<String> = Vec::with_capacity(config.peers.len() + 1);
        for peer in &config.peers {
            if peer != &config.self_id && !nodes.contains(peer) {
                nodes.push(peer.clone());
            }
        }
        let peers = nodes
            .iter()
            .map(|peer| {
                let factory = PeerConnectionFactory::new(
                    peer.clone(),
                    config.connect_timeout,
                    config.rpc_timeout,
                );
                (peer.clone(), Pool::new(factory, config.pool.clone()))
            })
            .collect();
        nodes.push(config.self_id.clone());

        let mut ring = HashRing::new(config.ring_replicas);
        ring.add_node(&nodes);
        tracing::info!(self_id = %config.self_id, nodes = ?nodes, "cluster membership");

        Self {
            self_id: config.self_id.clone(),
            nodes,
            ring,
            peers,
            db,
            router,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Every member, peers first and the local node last.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Node that owns `key`.
    pub fn pick_node(&self, key: &[u8]) -> &str {
        self.ring.get_node(key).unwrap_or(&self.self_id)
    }

    pub fn peer_pool_stats(&self, peer: &str) -> Option<PoolStats> {
        self.peers.get(peer).map(Pool::stats)
    }

    /// Execute one client command. Never panics: a panic inside a handler is
    /// logged and answered with a generic error.
    pub async fn exec(&self, conn: &mut dyn Connection, cmd_line: CmdLine) -> BytesFrame {
        let name = command_name(&cmd_line);
        match AssertUnwindSafe(self.dispatch(conn, cmd_line))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(
                    command = %name,
                    panic = %msg,
                    backtrace = %Backtrace::capture(),
                    "command handler panicked"
                );
                unknown_error_reply()
            }
        }
    }

    async fn dispatch(&self, conn: &mut dyn Connection, cmd_line: CmdLine) -> BytesFrame {
        if cmd_line.is_empty() {
            return error_reply("ERR empty command");
        }
        let name = command_name(&cmd_line);
        if name == RELAYED_COMMAND {
            if cmd_line.len() < 2 {
                return arity_error_reply(RELAYED_COMMAND);
            }
            return self.db.exec(conn, &cmd_line[1..]).await;
        }
        let Some(handler) = self.router.get(&name) else {
            return error_reply(format!(
                "ERR unknown command '{name}', or not supported in cluster mode"
            ));
        };
        handler(self, conn, cmd_line).await
    }

    pub async fn after_client_close(&self, conn: &dyn Connection) {
        self.db.after_client_close(conn).await;
    }

    /// Close the local database (draining the AOF) and every peer pool.
    pub async fn close(&self) {
        self.db.close().await;
        for pool in self.peers.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReplayConnection;
    use crate::database::MemoryDatabase;
    use crate::protocol::{bulk_reply, ok_reply, to_cmd_line};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;

    fn single_node(router: Router) -> ClusterDatabase {
        let config = Config::standalone("127.0.0.1:0".parse().unwrap());
        ClusterDatabase::new(&config, Arc::new(MemoryDatabase::new(4)), Arc::new(router))
    }

    fn boom<'a>(
        _cluster: &'a ClusterDatabase,
        _conn: &'a mut dyn Connection,
        _args: CmdLine,
    ) -> BoxFuture<'a, BytesFrame> {
        async move {
            if true {
                panic!("handler exploded");
            }
            ok_reply()
        }
        .boxed()
    }

    #[tokio::test]
    async fn single_node_executes_locally() {
        let cluster = single_node(Router::cluster_default());
        let mut conn = ReplayConnection::default();
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line(["SET", "k", "v"])).await,
            ok_reply()
        );
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line(["GET", "k"])).await,
            bulk_reply(Bytes::from_static(b"v"))
        );
        assert_eq!(cluster.nodes(), [cluster.self_id().to_string()]);
    }

    #[tokio::test]
    async fn unknown_and_empty_commands_are_rejected() {
        let cluster = single_node(Router::cluster_default());
        let mut conn = ReplayConnection::default();
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line(["HSET", "h", "f", "v"])).await,
            error_reply("ERR unknown command 'hset', or not supported in cluster mode")
        );
        assert_eq!(
            cluster.exec(&mut conn, Vec::new()).await,
            error_reply("ERR empty command")
        );
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_reply() {
        let mut router = Router::cluster_default();
        router.register("boom", boom);
        let cluster = single_node(router);
        let mut conn = ReplayConnection::default();
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line(["BOOM"])).await,
            unknown_error_reply()
        );
        // The coordinator keeps serving after a panic.
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line(["PING"])).await,
            BytesFrame::SimpleString(Bytes::from_static(b"PONG"))
        );
    }

    #[tokio::test]
    async fn relayed_commands_run_on_the_local_database() {
        let mut config = Config::standalone("127.0.0.1:7000".parse().unwrap());
        config.peers = vec!["127.0.0.1:7001".into()];
        let cluster = ClusterDatabase::new(
            &config,
            Arc::new(MemoryDatabase::new(2)),
            Arc::new(Router::cluster_default()),
        );
        let mut conn = ReplayConnection::default();
        assert_eq!(
            cluster
                .exec(&mut conn, to_cmd_line([RELAYED_COMMAND, "SET", "k", "v"]))
                .await,
            ok_reply()
        );
        // DBSIZE is a broadcast when routed; relayed it only counts this node.
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line([RELAYED_COMMAND, "DBSIZE"])).await,
            BytesFrame::Integer(1)
        );
        assert_eq!(
            cluster.exec(&mut conn, to_cmd_line([RELAYED_COMMAND])).await,
            arity_error_reply(RELAYED_COMMAND)
        );
        assert_eq!(cluster.peer_pool_stats("127.0.0.1:7001").unwrap().borrows, 0);
    }

    #[tokio::test]
    async fn self_is_not_a_peer() {
        let mut config = Config::standalone("127.0.0.1:7000".parse().unwrap());
        config.peers = vec!["127.0.0.1:7000".into(), "127.0.0.1:7001".into(), "127.0.0.1:7001".into()];
        let cluster = ClusterDatabase::new(
            &config,
            Arc::new(MemoryDatabase::new(1)),
            Arc::new(Router::cluster_default()),
        );
        assert_eq!(cluster.nodes(), ["127.0.0.1:7001", "127.0.0.1:7000"]);
        assert!(cluster.peer_pool_stats("127.0.0.1:7000").is_none());
        assert!(cluster.peer_pool_stats("127.0.0.1:7001").is_some());
    }
}
