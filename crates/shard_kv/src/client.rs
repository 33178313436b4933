//! RESP client used to relay commands to peer nodes.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::pool::ConnectionFactory;
use crate::protocol::cmd_line_frame;

/// One framed connection to a peer.
pub struct PeerClient {
    peer: String,
    framed: Framed<TcpStream, Resp2>,
    request_timeout: Duration,
}

impl PeerClient {
    pub async fn connect(
        peer: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let socket = time::timeout(connect_timeout, TcpStream::connect(peer))
            .await
            .with_context(|| format!("connect to {peer} timed out"))?
            .with_context(|| format!("connect to {peer}"))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            peer: peer.to_string(),
            framed: Framed::new(socket, Resp2::default()),
            request_timeout,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one command and wait for its reply.
    ///
    /// Any error leaves the stream in an unknown state; the caller should
    /// discard the connection.
    pub async fn send(&mut self, cmd_line: &[Bytes]) -> anyhow::Result<BytesFrame> {
        let req = cmd_line_frame(cmd_line);
        time::timeout(self.request_timeout, self.framed.send(req))
            .await
            .with_context(|| format!("send to {} timed out", self.peer))?
            .with_context(|| format!("send to {}", self.peer))?;

        match time::timeout(self.request_timeout, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(err))) => {
                Err(anyhow::Error::new(err).context(format!("recv from {}", self.peer)))
            }
            Ok(None) => anyhow::bail!("{} closed the connection", self.peer),
            Err(_) => anyhow::bail!("recv from {} timed out", self.peer),
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Makes [`PeerClient`]s to a single peer for the connection pool.
#[derive(Clone, Debug)]
pub struct PeerConnectionFactory {
    peer: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl PeerConnectionFactory {
    pub fn new(peer: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            peer: peer.into(),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl ConnectionFactory for PeerConnectionFactory {
    type Connection = PeerClient;

    async fn make(&self) -> anyhow::Result<PeerClient> {
        let client = PeerClient::connect(&self.peer, self.connect_timeout, self.request_timeout).await?;
        tracing::debug!(peer = %self.peer, "opened peer connection");
        Ok(client)
    }

    async fn destroy(&self, conn: PeerClient) -> anyhow::Result<()> {
        conn.close().await
    }
}
