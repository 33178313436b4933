//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use shard_kv::aof::{AofSettings, AppendFsync};
use shard_kv::protocol::{cmd_line_frame, to_cmd_line};
use shard_kv::{start_node, Config, NodeHandle};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

/// Timeout for a single command round-trip.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn free_addr() -> SocketAddr {
    let port = pick_free_port().expect("pick free port");
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Config for one member of a cluster made of `members`.
pub fn member_config(addr: SocketAddr, members: &[SocketAddr]) -> Config {
    let mut config = Config::standalone(addr);
    config.peers = members
        .iter()
        .filter(|member| **member != addr)
        .map(|member| member.to_string())
        .collect();
    config.connect_timeout = Duration::from_millis(500);
    config.rpc_timeout = Duration::from_secs(2);
    config
}

/// Same as `member_config`, persisting to `path`.
pub fn with_aof(mut config: Config, path: &Path) -> Config {
    config.aof = AofSettings {
        fsync: AppendFsync::Always,
        ..AofSettings::new(path)
    };
    config
}

/// Start `n` in-process nodes that know about each other.
pub async fn start_cluster(n: usize) -> Vec<NodeHandle> {
    let addrs: Vec<SocketAddr> = (0..n).map(|_| free_addr()).collect();
    let mut nodes = Vec::with_capacity(n);
    for addr in &addrs {
        let node = start_node(member_config(*addr, &addrs))
            .await
            .expect("start node");
        nodes.push(node);
    }
    nodes
}

pub async fn shutdown_all(nodes: Vec<NodeHandle>) {
    for node in nodes {
        node.shutdown().await.expect("node shutdown");
    }
}

/// Minimal RESP client for driving a node from tests.
pub struct RespClient {
    framed: Framed<TcpStream, Resp2>,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let socket = time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect");
        socket.set_nodelay(true).ok();
        Self {
            framed: Framed::new(socket, Resp2::default()),
        }
    }

    pub async fn send_frame(&mut self, frame: BytesFrame) -> BytesFrame {
        time::timeout(IO_TIMEOUT, self.framed.send(frame))
            .await
            .expect("send timed out")
            .expect("send");
        time::timeout(IO_TIMEOUT, self.framed.next())
            .await
            .expect("recv timed out")
            .expect("connection closed")
            .expect("decode reply")
    }

    pub async fn cmd(&mut self, parts: &[&str]) -> BytesFrame {
        self.send_frame(cmd_line_frame(&to_cmd_line(parts))).await
    }
}

pub fn bulk(value: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::copy_from_slice(value.as_bytes()))
}

pub fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

pub fn error_text(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::Error(msg) => {
            let text: &str = msg;
            Some(text.to_string())
        }
        _ => None,
    }
}
