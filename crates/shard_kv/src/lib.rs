//! Transparently sharded key-value store.
//!
//! Any node accepts any command: keys are mapped to their owning node with a
//! consistent-hash ring and relayed over pooled RESP connections. Each node
//! persists its own writes to an append-only file and replays it on startup.

pub mod aof;
pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod database;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod redis_server;
pub mod ring;

pub use cluster::{ClusterDatabase, Router};
pub use config::{Config, NodeArgs};
pub use node::{run_node, run_node_with_shutdown, start_node, start_node_with_router, Node, NodeHandle};
