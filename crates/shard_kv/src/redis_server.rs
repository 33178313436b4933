use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use crate::cluster::ClusterDatabase;
use crate::connection::ClientConnection;
use crate::protocol::{error_reply, frame_to_cmd_line};

/// Accept clients until `shutdown` resolves, then stop every connection task
/// and wait for them to finish.
pub async fn serve<F>(
    listener: TcpListener,
    cluster: Arc<ClusterDatabase>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut conns = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = ?err, "redis accept failed");
                        continue;
                    }
                };
                let cluster = cluster.clone();
                let stop_rx = stop_rx.clone();
                conns.spawn(async move {
                    if let Err(err) = handle_conn(socket, addr, cluster, stop_rx).await {
                        tracing::debug!(error = ?err, addr = %addr, "redis connection closed");
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }

    let _ = stop_tx.send(true);
    while conns.join_next().await.is_some() {}
    Ok(())
}

async fn handle_conn(
    socket: TcpStream,
    addr: SocketAddr,
    cluster: Arc<ClusterDatabase>,
    mut stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, Resp2::default());
    let mut conn = ClientConnection::new(addr);
    tracing::trace!(addr = %addr, "redis client connected");

    async fn feed_resp(
        framed: &mut Framed<TcpStream, Resp2>,
        resp: BytesFrame,
    ) -> anyhow::Result<()> {
        framed.feed(resp).await?;
        Ok(())
    }

    async fn flush_resp(framed: &mut Framed<TcpStream, Resp2>) -> anyhow::Result<()> {
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(framed).await?;
        Ok(())
    }

    let result = async {
        loop {
            let frame = tokio::select! {
                _ = stop_rx.changed() => break,
                frame = framed.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            let cmd_line = match frame_to_cmd_line(frame?) {
                Ok(cmd_line) if cmd_line.is_empty() => continue,
                Ok(cmd_line) => cmd_line,
                Err(err) => {
                    feed_resp(&mut framed, error_reply(format!("ERR {err}"))).await?;
                    flush_resp(&mut framed).await?;
                    continue;
                }
            };
            let reply = cluster.exec(&mut conn, cmd_line).await;
            feed_resp(&mut framed, reply).await?;
            flush_resp(&mut framed).await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    cluster.after_client_close(&conn).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::MemoryDatabase;
    use crate::protocol::{cmd_line_frame, ok_reply, to_cmd_line};
    use crate::cluster::Router;
    use bytes::Bytes;

    async fn start() -> (SocketAddr, tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cluster = Arc::new(ClusterDatabase::new(
            &Config::standalone(addr),
            Arc::new(MemoryDatabase::new(2)),
            Arc::new(Router::cluster_default()),
        ));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, cluster, async move {
            let _ = rx.await;
        }));
        (addr, tx, task)
    }

    async fn call(framed: &mut Framed<TcpStream, Resp2>, frame: BytesFrame) -> BytesFrame {
        framed.send(frame).await.unwrap();
        framed.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn serves_commands_and_rejects_non_arrays() {
        let (addr, stop, task) = start().await;
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, Resp2::default());

        let reply = call(&mut framed, cmd_line_frame(&to_cmd_line(["SET", "k", "v"]))).await;
        assert_eq!(reply, ok_reply());
        let reply = call(&mut framed, cmd_line_frame(&to_cmd_line(["GET", "k"]))).await;
        assert_eq!(reply, BytesFrame::BulkString(Bytes::from_static(b"v")));
        let reply = call(&mut framed, BytesFrame::Integer(1)).await;
        assert_eq!(reply, error_reply("ERR expected array frame"));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
        // Open connections are closed on shutdown.
        assert!(framed.next().await.is_none());
    }
}
