//! Node configuration: CLI/env flags and the resolved runtime config.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::aof::{AofSettings, AppendFsync, AOF_QUEUE_SIZE};
use crate::database::DEFAULT_DATABASES;
use crate::pool::{PoolConfig, DEFAULT_POOL_CAPACITY};
use crate::ring::DEFAULT_RING_REPLICAS;

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    /// Address the Redis listener binds to.
    #[arg(long, env = "SHARD_KV_LISTEN", default_value = "127.0.0.1:6399")]
    pub listen: SocketAddr,

    /// Id of this node on the hash ring. Peers must list it under the same
    /// string. Defaults to the listen address.
    #[arg(long, env = "SHARD_KV_SELF_ID")]
    pub self_id: Option<String>,

    /// Comma-separated peer addresses like `10.0.0.2:6399,10.0.0.3:6399`.
    #[arg(long, env = "SHARD_KV_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    #[arg(long, env = "SHARD_KV_DATABASES", default_value_t = DEFAULT_DATABASES)]
    pub databases: usize,

    /// Persist mutations to the append-only file and replay it on startup.
    #[arg(
        long,
        env = "SHARD_KV_APPENDONLY",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub appendonly: bool,

    #[arg(long, env = "SHARD_KV_APPEND_FILENAME", default_value = "appendonly.aof")]
    pub append_filename: PathBuf,

    #[arg(long, env = "SHARD_KV_APPENDFSYNC", value_enum, default_value = "everysec")]
    pub appendfsync: AppendFsync,

    /// Capacity of the AOF producer queue.
    #[arg(long, env = "SHARD_KV_AOF_QUEUE_SIZE", default_value_t = AOF_QUEUE_SIZE)]
    pub aof_queue_size: usize,

    /// Virtual positions per node on the hash ring. Must match across the
    /// cluster.
    #[arg(long, env = "SHARD_KV_RING_REPLICAS", default_value_t = DEFAULT_RING_REPLICAS)]
    pub ring_replicas: usize,

    /// Max live connections per peer.
    #[arg(long, env = "SHARD_KV_POOL_CAPACITY", default_value_t = DEFAULT_POOL_CAPACITY)]
    pub pool_capacity: usize,

    /// Idle peer connections older than this are closed (0 disables).
    #[arg(long, env = "SHARD_KV_POOL_IDLE_TIMEOUT_MS", default_value_t = 60_000)]
    pub pool_idle_timeout_ms: u64,

    /// How long a relay waits for a free peer connection (0 waits forever).
    #[arg(long, env = "SHARD_KV_POOL_BORROW_TIMEOUT_MS", default_value_t = 2_000)]
    pub pool_borrow_timeout_ms: u64,

    #[arg(long, env = "SHARD_KV_CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub connect_timeout_ms: u64,

    /// Per-request timeout for relayed commands.
    #[arg(long, env = "SHARD_KV_RPC_TIMEOUT_MS", default_value_t = 5_000)]
    pub rpc_timeout_ms: u64,
}

/// Resolved node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub self_id: String,
    /// Other members; never contains `self_id`.
    pub peers: Vec<String>,
    pub databases: usize,
    pub aof: AofSettings,
    pub ring_replicas: usize,
    pub pool: PoolConfig,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Config {
    /// Single node with persistence off and default tuning.
    pub fn standalone(listen: SocketAddr) -> Self {
        Self {
            listen,
            self_id: listen.to_string(),
            peers: Vec::new(),
            databases: DEFAULT_DATABASES,
            aof: AofSettings {
                enabled: false,
                ..AofSettings::new("appendonly.aof")
            },
            ring_replicas: DEFAULT_RING_REPLICAS,
            pool: PoolConfig::default(),
            connect_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl NodeArgs {
    /// Validate the flags and resolve the self id and peer list.
    pub fn into_config(self) -> anyhow::Result<Config> {
        anyhow::ensure!(self.databases > 0, "--databases must be at least 1");
        anyhow::ensure!(self.ring_replicas > 0, "--ring-replicas must be at least 1");
        anyhow::ensure!(self.pool_capacity > 0, "--pool-capacity must be at least 1");
        anyhow::ensure!(self.aof_queue_size > 0, "--aof-queue-size must be at least 1");
        anyhow::ensure!(self.connect_timeout_ms > 0, "--connect-timeout-ms must be positive");
        anyhow::ensure!(self.rpc_timeout_ms > 0, "--rpc-timeout-ms must be positive");

        let self_id = match self.self_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => self.listen.to_string(),
        };

        let mut peers: Vec<String> = Vec::with_capacity(self.peers.len());
        for peer in self.peers.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if peer == self_id {
                tracing::warn!(peer = %peer, "ignoring self in peer list");
                continue;
            }
            if !peers.iter().any(|p| p == peer) {
                peers.push(peer.to_string());
            }
        }

        Ok(Config {
            listen: self.listen,
            self_id,
            peers,
            databases: self.databases,
            aof: AofSettings {
                enabled: self.appendonly,
                filename: self.append_filename,
                fsync: self.appendfsync,
                queue_size: self.aof_queue_size,
            },
            ring_replicas: self.ring_replicas,
            pool: PoolConfig {
                capacity: self.pool_capacity,
                idle_timeout: millis_or_none(self.pool_idle_timeout_ms),
                borrow_timeout: millis_or_none(self.pool_borrow_timeout_ms),
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
        })
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> NodeArgs {
        NodeArgs::try_parse_from(std::iter::once("shard-kv-node").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_resolve_to_standalone_node() {
        let config = parse(&["--listen", "127.0.0.1:7000"]).into_config().unwrap();
        assert_eq!(config.self_id, "127.0.0.1:7000");
        assert!(config.peers.is_empty());
        assert_eq!(config.databases, DEFAULT_DATABASES);
        assert!(!config.aof.enabled);
        assert_eq!(config.aof.fsync, AppendFsync::EverySec);
        assert_eq!(config.aof.queue_size, AOF_QUEUE_SIZE);
        assert_eq!(config.pool.borrow_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn peers_are_trimmed_and_exclude_self() {
        let config = parse(&[
            "--listen",
            "127.0.0.1:7000",
            "--peers",
            "127.0.0.1:7001, 127.0.0.1:7000,,127.0.0.1:7001,127.0.0.1:7002",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.peers, vec!["127.0.0.1:7001", "127.0.0.1:7002"]);
    }

    #[test]
    fn aof_flags() {
        let config = parse(&[
            "--appendonly",
            "true",
            "--append-filename",
            "/tmp/node.aof",
            "--appendfsync",
            "always",
            "--pool-idle-timeout-ms",
            "0",
        ])
        .into_config()
        .unwrap();
        assert!(config.aof.enabled);
        assert_eq!(config.aof.filename, PathBuf::from("/tmp/node.aof"));
        assert_eq!(config.aof.fsync, AppendFsync::Always);
        assert_eq!(config.pool.idle_timeout, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--databases", "0"]).into_config().is_err());
        assert!(NodeArgs::try_parse_from(["shard-kv-node", "--appendfsync", "sometimes"]).is_err());
    }
}
