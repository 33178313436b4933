use std::collections::HashMap;

use anyhow::Context;
use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use super::{ClusterDatabase, RELAYED_COMMAND};
use crate::client::{PeerClient, PeerConnectionFactory};
use crate::connection::Connection;
use crate::pool::{Pool, PooledConnection};
use crate::protocol::{error_reply, is_error_reply, to_cmd_line};

impl ClusterDatabase {
    /// Run `args` on `peer` in the caller's selected database.
    ///
    /// The local node goes straight to the database. For remote peers a
    /// pooled connection is borrowed, `SELECT` is replayed, then the command
    /// is sent wrapped in [`RELAYED_COMMAND`] so the peer executes it locally.
    /// Failures come back as `ERR` replies.
    pub async fn relay(&self, peer: &str, conn: &mut dyn Connection, args: &[Bytes]) -> BytesFrame {
        if peer == self.self_id {
            return self.db.exec(conn, args).await;
        }
        match self.relay_to_peer(peer, conn.db_index(), args).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(peer = %peer, error = ?err, "relay failed");
                error_reply(format!("ERR {err:#}"))
            }
        }
    }

    async fn relay_to_peer(
        &self,
        peer: &str,
        db_index: usize,
        args: &[Bytes],
    ) -> anyhow::Result<BytesFrame> {
        let (pool, mut client) = self.borrow_peer(peer).await?;

        let select = relayed(&to_cmd_line(["SELECT".to_string(), db_index.to_string()]));
        let result: anyhow::Result<BytesFrame> = async {
            let reply = client.send(&select).await?;
            if is_error_reply(&reply) {
                return Ok(reply);
            }
            client.send(&relayed(args)).await
        }
        .await;

        match result {
            Ok(reply) => {
                if let Err(err) = pool.give_back(client).await {
                    tracing::debug!(peer = %peer, error = ?err, "return peer connection failed");
                }
                Ok(reply)
            }
            Err(err) => {
                // The stream may hold a late reply; never reuse it.
                pool.invalidate(client).await;
                Err(err)
            }
        }
    }

    /// Borrow a pooled connection to `peer` along with the pool it must go
    /// back to.
    pub async fn borrow_peer(
        &self,
        peer: &str,
    ) -> anyhow::Result<(&Pool<PeerConnectionFactory>, PooledConnection<PeerClient>)> {
        let pool = self
            .peers
            .get(peer)
            .context("connection factory not found")?;
        let client = pool
            .borrow()
            .await
            .with_context(|| format!("borrow connection to {peer}"))?;
        Ok((pool, client))
    }

    /// Relay `args` to every node, the local one included. One reply per
    /// node; a failing node does not stop the others.
    pub async fn broadcast(
        &self,
        conn: &mut dyn Connection,
        args: &[Bytes],
    ) -> HashMap<String, BytesFrame> {
        let mut replies = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let reply = self.relay(node, conn, args).await;
            replies.insert(node.clone(), reply);
        }
        replies
    }
}

fn relayed(args: &[Bytes]) -> Vec<Bytes> {
    let mut wrapped = Vec::with_capacity(args.len() + 1);
    wrapped.push(Bytes::from_static(RELAYED_COMMAND.as_bytes()));
    wrapped.extend_from_slice(args);
    wrapped
}
