//! Restart tests for append-only persistence.
//!
//! A node writes through the Redis listener with the AOF enabled, is shut down
//! gracefully (draining the AOF), and is restarted on the same file. Every
//! acknowledged write must be visible again after replay.

mod common;

use bytes::BytesMut;
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use shard_kv::protocol::frame_to_cmd_line;
use shard_kv::start_node;
use tempfile::TempDir;
use tokio_util::codec::Decoder;

use common::{bulk, free_addr, member_config, ok, with_aof, RespClient};

fn commands_in(path: &std::path::Path) -> Vec<Vec<String>> {
    let mut buf = BytesMut::from(std::fs::read(path).unwrap().as_slice());
    let mut codec = Resp2::default();
    let mut out = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        out.push(
            frame_to_cmd_line(frame)
                .unwrap()
                .iter()
                .map(|part| String::from_utf8_lossy(part).to_string())
                .collect(),
        );
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("appendonly.aof");
    let addr = free_addr();
    let config = with_aof(member_config(addr, &[addr]), &path);

    let node = start_node(config.clone()).await.unwrap();
    let mut client = RespClient::connect(node.local_addr()).await;
    assert_eq!(client.cmd(&["SET", "a", "1"]).await, ok());
    assert_eq!(client.cmd(&["SELECT", "1"]).await, ok());
    assert_eq!(client.cmd(&["SET", "b", "2"]).await, ok());
    assert_eq!(client.cmd(&["SET", "c", "3"]).await, ok());
    assert_eq!(client.cmd(&["INCR", "c"]).await, BytesFrame::Integer(4));
    // Reads and no-op writes are not persisted.
    assert_eq!(client.cmd(&["GET", "b"]).await, bulk("2"));
    assert_eq!(client.cmd(&["SETNX", "b", "other"]).await, BytesFrame::Integer(0));
    drop(client);
    node.shutdown().await.unwrap();

    assert_eq!(
        commands_in(&path),
        vec![
            vec!["SET", "a", "1"],
            vec!["SELECT", "1"],
            vec!["SET", "b", "2"],
            vec!["SET", "c", "3"],
            vec!["INCR", "c"],
        ]
    );

    let node = start_node(config).await.unwrap();
    let mut client = RespClient::connect(node.local_addr()).await;
    assert_eq!(client.cmd(&["GET", "a"]).await, bulk("1"));
    assert_eq!(client.cmd(&["GET", "b"]).await, BytesFrame::Null);
    assert_eq!(client.cmd(&["SELECT", "1"]).await, ok());
    assert_eq!(client.cmd(&["GET", "b"]).await, bulk("2"));
    assert_eq!(client.cmd(&["GET", "c"]).await, bulk("4"));

    // Replay did not append the replayed commands a second time.
    assert_eq!(client.cmd(&["DEL", "b"]).await, BytesFrame::Integer(1));
    drop(client);
    node.shutdown().await.unwrap();
    let commands = commands_in(&path);
    assert_eq!(commands.len(), 7);
    assert_eq!(commands[6], vec!["DEL", "b"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_tail_does_not_block_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("appendonly.aof");
    std::fs::write(
        &path,
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1",
    )
    .unwrap();
    let addr = free_addr();
    let node = start_node(with_aof(member_config(addr, &[addr]), &path))
        .await
        .unwrap();

    let mut client = RespClient::connect(node.local_addr()).await;
    assert_eq!(client.cmd(&["GET", "a"]).await, bulk("1"));
    assert_eq!(client.cmd(&["GET", "b"]).await, BytesFrame::Null);
    drop(client);
    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fresh.aof");
    let addr = free_addr();
    let node = start_node(with_aof(member_config(addr, &[addr]), &path))
        .await
        .unwrap();
    let mut client = RespClient::connect(node.local_addr()).await;
    assert_eq!(client.cmd(&["DBSIZE"]).await, BytesFrame::Integer(0));
    drop(client);
    node.shutdown().await.unwrap();
    assert!(path.exists());
}
