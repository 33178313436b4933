//! Single-node storage engine used behind the cluster coordinator.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::RwLock;

use crate::aof::AofHandler;
use crate::connection::Connection;
use crate::protocol::{
    arity_error_reply, bulk_reply, command_name, error_reply, int_reply, null_reply, ok_reply,
};

/// Default number of logical databases selectable with `SELECT`.
pub const DEFAULT_DATABASES: usize = 16;

/// Local command executor.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> BytesFrame;

    async fn after_client_close(&self, conn: &dyn Connection);

    async fn close(&self);
}

type Keyspace = HashMap<Bytes, Bytes>;

/// In-memory string store with `SELECT`-able logical databases.
///
/// Mutations are appended to the attached AOF while the keyspace write lock
/// is still held, so the log order matches the order writes were applied.
pub struct MemoryDatabase {
    dbs: Vec<RwLock<Keyspace>>,
    aof: OnceLock<Arc<AofHandler>>,
}

impl MemoryDatabase {
    pub fn new(databases: usize) -> Self {
        let dbs = (0..databases.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            dbs,
            aof: OnceLock::new(),
        }
    }

    /// Attach the AOF that receives every successful mutation.
    pub fn attach_aof(&self, aof: Arc<AofHandler>) {
        if self.aof.set(aof).is_err() {
            tracing::warn!("aof already attached to database");
        }
    }

    pub fn databases(&self) -> usize {
        self.dbs.len()
    }

    /// Read a key directly, bypassing command parsing.
    pub async fn get(&self, db_index: usize, key: &[u8]) -> Option<Bytes> {
        self.dbs.get(db_index)?.read().await.get(key).cloned()
    }

    pub async fn len(&self, db_index: usize) -> usize {
        match self.dbs.get(db_index) {
            Some(db) => db.read().await.len(),
            None => 0,
        }
    }

    async fn append_aof(&self, db_index: usize, cmd_line: &[Bytes]) {
        if let Some(aof) = self.aof.get() {
            aof.add_aof(db_index, cmd_line.to_vec()).await;
        }
    }

    fn select(&self, conn: &mut dyn Connection, args: &[Bytes]) -> BytesFrame {
        if args.len() != 2 {
            return arity_error_reply("select");
        }
        let Some(index) = parse_i64(&args[1]) else {
            return error_reply("ERR invalid DB index");
        };
        if index < 0 || index as usize >= self.dbs.len() {
            return error_reply("ERR DB index is out of range");
        }
        conn.select_db(index as usize);
        ok_reply()
    }

    async fn read_command(&self, db: &RwLock<Keyspace>, name: &str, args: &[Bytes]) -> BytesFrame {
        let keyspace = db.read().await;
        match name {
            "get" => {
                if args.len() != 2 {
                    return arity_error_reply(name);
                }
                keyspace
                    .get(&args[1])
                    .cloned()
                    .map(bulk_reply)
                    .unwrap_or_else(null_reply)
            }
            "mget" => {
                if args.len() < 2 {
                    return arity_error_reply(name);
                }
                BytesFrame::Array(
                    args[1..]
                        .iter()
                        .map(|key| {
                            keyspace
                                .get(key)
                                .cloned()
                                .map(bulk_reply)
                                .unwrap_or_else(null_reply)
                        })
                        .collect(),
                )
            }
            "exists" => {
                if args.len() < 2 {
                    return arity_error_reply(name);
                }
                let count = args[1..].iter().filter(|k| keyspace.contains_key(*k)).count();
                int_reply(count as i64)
            }
            "type" => {
                if args.len() != 2 {
                    return arity_error_reply(name);
                }
                let kind = if keyspace.contains_key(&args[1]) {
                    "string"
                } else {
                    "none"
                };
                BytesFrame::SimpleString(Bytes::from_static(kind.as_bytes()))
            }
            "strlen" => {
                if args.len() != 2 {
                    return arity_error_reply(name);
                }
                int_reply(keyspace.get(&args[1]).map_or(0, |v| v.len() as i64))
            }
            "dbsize" => {
                if args.len() != 1 {
                    return arity_error_reply(name);
                }
                int_reply(keyspace.len() as i64)
            }
            _ => unknown_command(name),
        }
    }

    async fn write_command(
        &self,
        db_index: usize,
        name: &str,
        args: &[Bytes],
    ) -> BytesFrame {
        let mut keyspace = self.dbs[db_index].write().await;
        let (reply, mutated) = apply_write(&mut keyspace, name, args);
        if mutated {
            self.append_aof(db_index, args).await;
        }
        reply
    }

    async fn flush_all(&self, db_index: usize, args: &[Bytes]) -> BytesFrame {
        if args.len() != 1 {
            return arity_error_reply("flushall");
        }
        let mut guards = Vec::with_capacity(self.dbs.len());
        for db in &self.dbs {
            guards.push(db.write().await);
        }
        for keyspace in guards.iter_mut() {
            keyspace.clear();
        }
        self.append_aof(db_index, args).await;
        ok_reply()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> BytesFrame {
        let name = command_name(cmd_line);
        match name.as_str() {
            "" => error_reply("ERR empty command"),
            "ping" => match cmd_line.len() {
                1 => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
                2 => bulk_reply(cmd_line[1].clone()),
                _ => arity_error_reply("ping"),
            },
            "echo" => {
                if cmd_line.len() != 2 {
                    return arity_error_reply("echo");
                }
                bulk_reply(cmd_line[1].clone())
            }
            "select" => self.select(conn, cmd_line),
            "flushall" => self.flush_all(conn.db_index(), cmd_line).await,
            "get" | "mget" | "exists" | "type" | "strlen" | "dbsize" => {
                let Some(db) = self.dbs.get(conn.db_index()) else {
                    return error_reply("ERR DB index is out of range");
                };
                self.read_command(db, &name, cmd_line).await
            }
            "set" | "setnx" | "getset" | "del" | "incr" | "decr" | "append" | "rename"
            | "flushdb" => {
                let db_index = conn.db_index();
                if db_index >= self.dbs.len() {
                    return error_reply("ERR DB index is out of range");
                }
                self.write_command(db_index, &name, cmd_line).await
            }
            _ => unknown_command(&name),
        }
    }

    async fn after_client_close(&self, conn: &dyn Connection) {
        tracing::trace!(addr = ?conn.remote_addr(), "client closed");
    }

    async fn close(&self) {
        if let Some(aof) = self.aof.get() {
            aof.close().await;
        }
    }
}

/// Apply a mutating command. Returns the reply and whether the keyspace
/// changed (and therefore must be persisted).
fn apply_write(keyspace: &mut Keyspace, name: &str, args: &[Bytes]) -> (BytesFrame, bool) {
    match name {
        "set" => {
            if args.len() != 3 {
                return (arity_error_reply(name), false);
            }
            keyspace.insert(args[1].clone(), args[2].clone());
            (ok_reply(), true)
        }
        "setnx" => {
            if args.len() != 3 {
                return (arity_error_reply(name), false);
            }
            if keyspace.contains_key(&args[1]) {
                return (int_reply(0), false);
            }
            keyspace.insert(args[1].clone(), args[2].clone());
            (int_reply(1), true)
        }
        "getset" => {
            if args.len() != 3 {
                return (arity_error_reply(name), false);
            }
            let old = keyspace.insert(args[1].clone(), args[2].clone());
            (old.map(bulk_reply).unwrap_or_else(null_reply), true)
        }
        "del" => {
            if args.len() < 2 {
                return (arity_error_reply(name), false);
            }
            let removed = args[1..]
                .iter()
                .filter(|key| keyspace.remove(*key).is_some())
                .count();
            (int_reply(removed as i64), removed > 0)
        }
        "incr" | "decr" => {
            if args.len() != 2 {
                return (arity_error_reply(name), false);
            }
            let delta = if name == "incr" { 1 } else { -1 };
            let current = match keyspace.get(&args[1]) {
                Some(value) => match parse_i64(value) {
                    Some(n) => n,
                    None => {
                        return (
                            error_reply("ERR value is not an integer or out of range"),
                            false,
                        )
                    }
                },
                None => 0,
            };
            let Some(next) = current.checked_add(delta) else {
                return (error_reply("ERR increment or decrement would overflow"), false);
            };
            keyspace.insert(args[1].clone(), Bytes::from(next.to_string()));
            (int_reply(next), true)
        }
        "append" => {
            if args.len() != 3 {
                return (arity_error_reply(name), false);
            }
            let mut value = keyspace
                .get(&args[1])
                .map(|v| v.to_vec())
                .unwrap_or_default();
            value.extend_from_slice(&args[2]);
            let len = value.len() as i64;
            keyspace.insert(args[1].clone(), Bytes::from(value));
            (int_reply(len), true)
        }
        "rename" => {
            if args.len() != 3 {
                return (arity_error_reply(name), false);
            }
            let Some(value) = keyspace.remove(&args[1]) else {
                return (error_reply("ERR no such key"), false);
            };
            keyspace.insert(args[2].clone(), value);
            (ok_reply(), true)
        }
        "flushdb" => {
            if args.len() != 1 {
                return (arity_error_reply(name), false);
            }
            keyspace.clear();
            (ok_reply(), true)
        }
        _ => (unknown_command(name), false),
    }
}

fn unknown_command(name: &str) -> BytesFrame {
    error_reply(format!("ERR unknown command '{name}'"))
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
