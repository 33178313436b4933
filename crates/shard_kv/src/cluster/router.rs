//! Command table for cluster mode.
//!
//! Handlers decide where a command runs: locally, on the owner of its key, or
//! on every node. Multi-key commands are split per owner and their replies
//! merged back.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use redis_protocol::resp2::types::BytesFrame;

use super::ClusterDatabase;
use crate::connection::Connection;
use crate::protocol::{
    arity_error_reply, command_name, error_reply, int_reply, ok_reply, CmdLine,
};

/// A cluster command handler.
pub type CmdFunc = for<'a> fn(
    &'a ClusterDatabase,
    &'a mut dyn Connection,
    CmdLine,
) -> BoxFuture<'a, BytesFrame>;

#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<String, CmdFunc>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under a case-insensitive command name, replacing
    /// any previous one.
    pub fn register(&mut self, name: &str, handler: CmdFunc) {
        self.handlers.insert(name.to_ascii_lowercase(), handler);
    }

    /// Look up a lowercase command name.
    pub fn get(&self, name: &str) -> Option<CmdFunc> {
        self.handlers.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The command set supported in cluster mode.
    pub fn cluster_default() -> Self {
        let mut router = Self::new();
        for name in ["ping", "select", "echo"] {
            router.register(name, exec_local);
        }
        for name in [
            "get", "set", "setnx", "getset", "type", "strlen", "incr", "decr", "append",
        ] {
            router.register(name, relay_by_key);
        }
        router.register("del", exec_counted_keys);
        router.register("exists", exec_counted_keys);
        router.register("mget", exec_mget);
        router.register("rename", exec_rename);
        router.register("flushdb", exec_flush);
        router.register("flushall", exec_flush);
        router.register("dbsize", exec_dbsize);
        router
    }
}

/// Run on this node only.
fn exec_local<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move { cluster.db.exec(conn, &args).await }.boxed()
}

/// Run on the owner of `args[1]`.
fn relay_by_key<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        if args.len() < 2 {
            return arity_error_reply(&command_name(&args));
        }
        let peer = cluster.pick_node(&args[1]);
        cluster.relay(peer, conn, &args).await
    }
    .boxed()
}

/// `DEL`/`EXISTS`: one command per owner, integer replies summed.
fn exec_counted_keys<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        if args.len() < 2 {
            return arity_error_reply(&command_name(&args));
        }
        let mut total = 0i64;
        for (peer, keys) in group_by_owner(cluster, &args[1..]) {
            let mut sub = Vec::with_capacity(keys.len() + 1);
            sub.push(args[0].clone());
            sub.extend(keys.into_iter().map(|(_, key)| key));
            match cluster.relay(peer, conn, &sub).await {
                BytesFrame::Integer(n) => total += n,
                err @ BytesFrame::Error(_) => return err,
                other => return unexpected_reply(peer, &other),
            }
        }
        int_reply(total)
    }
    .boxed()
}

/// `MGET`: one `MGET` per owner, values put back in request order.
fn exec_mget<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        if args.len() < 2 {
            return arity_error_reply("mget");
        }
        let mut values = vec![BytesFrame::Null; args.len() - 1];
        for (peer, keys) in group_by_owner(cluster, &args[1..]) {
            let mut sub = Vec::with_capacity(keys.len() + 1);
            sub.push(args[0].clone());
            sub.extend(keys.iter().map(|(_, key)| key.clone()));
            match cluster.relay(peer, conn, &sub).await {
                BytesFrame::Array(items) if items.len() == keys.len() => {
                    for ((index, _), item) in keys.into_iter().zip(items) {
                        values[index] = item;
                    }
                }
                err @ BytesFrame::Error(_) => return err,
                other => return unexpected_reply(peer, &other),
            }
        }
        BytesFrame::Array(values)
    }
    .boxed()
}

/// `RENAME` works only when source and destination share an owner.
fn exec_rename<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        if args.len() != 3 {
            return arity_error_reply("rename");
        }
        let src = cluster.pick_node(&args[1]);
        let dst = cluster.pick_node(&args[2]);
        if src != dst {
            return error_reply("ERR rename must be within one node in cluster mode");
        }
        cluster.relay(src, conn, &args).await
    }
    .boxed()
}

/// `FLUSHDB`/`FLUSHALL` on every node.
fn exec_flush<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        let replies = cluster.broadcast(conn, &args).await;
        for node in cluster.nodes() {
            if let Some(err @ BytesFrame::Error(_)) = replies.get(node) {
                return err.clone();
            }
        }
        ok_reply()
    }
    .boxed()
}

/// `DBSIZE` summed across nodes.
fn exec_dbsize<'a>(
    cluster: &'a ClusterDatabase,
    conn: &'a mut dyn Connection,
    args: CmdLine,
) -> BoxFuture<'a, BytesFrame> {
    async move {
        let replies = cluster.broadcast(conn, &args).await;
        let mut total = 0i64;
        for node in cluster.nodes() {
            match replies.get(node) {
                Some(BytesFrame::Integer(n)) => total += n,
                Some(err @ BytesFrame::Error(_)) => return err.clone(),
                Some(other) => return unexpected_reply(node, other),
                None => {}
            }
        }
        int_reply(total)
    }
    .boxed()
}

/// Keys grouped by owner, each tagged with its position in the request.
/// Owners appear in the order their first key does.
fn group_by_owner<'c>(
    cluster: &'c ClusterDatabase,
    keys: &[Bytes],
) -> Vec<(&'c str, Vec<(usize, Bytes)>)> {
    let mut groups: Vec<(&str, Vec<(usize, Bytes)>)> = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        let owner = cluster.pick_node(key);
        match groups.iter_mut().find(|(peer, _)| *peer == owner) {
            Some((_, group)) => group.push((index, key.clone())),
            None => groups.push((owner, vec![(index, key.clone())])),
        }
    }
    groups
}

fn unexpected_reply(peer: &str, reply: &BytesFrame) -> BytesFrame {
    tracing::warn!(peer = %peer, reply = ?reply, "unexpected reply from peer");
    error_reply(format!("ERR unexpected reply from {peer}"))
}
