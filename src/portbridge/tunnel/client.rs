use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::portbridge::{
    net, telemetry,
    tunnel::{
        multiplexer::Multiplexer,
        protocol::{ConnectionId, READ_CHUNK},
        table::Table,
    },
};

/// Where the multiplexer's reader loop delivers inbound reply payloads.
#[async_trait]
pub trait LocalSink: Send + Sync {
    /// Writes `data` to the local socket for `id`; unknown ids are ignored.
    async fn write_to_local(&self, id: ConnectionId, data: &[u8]);
    /// The far side of `id` is gone: close the local socket and stop forwarding it.
    async fn remote_closed(&self, id: ConnectionId);
}

pub struct LocalSocket {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

/// ConnectionId -> accepted local socket (write side).
pub struct LocalSockets {
    table: Table<ConnectionId, Arc<LocalSocket>>,
}

impl LocalSockets {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.table
            .snapshot()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.len().await
    }
}

#[async_trait]
impl LocalSink for LocalSockets {
    async fn write_to_local(&self, id: ConnectionId, data: &[u8]) {
        let Some(sock) = self.table.get(&id).await else {
            return;
        };
        let mut w = sock.writer.lock().await;
        let res = async {
            w.write_all(data).await?;
            w.flush().await
        }
        .await;
        match res {
            Ok(()) => {
                metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "to_local")
                    .increment(data.len() as u64);
            }
            Err(err) => {
                tracing::debug!(conn = %id, client = %sock.peer, err = %err, "client: write to local failed");
            }
        }
    }

    async fn remote_closed(&self, id: ConnectionId) {
        let Some(sock) = self.table.get(&id).await else {
            return;
        };
        tracing::debug!(conn = %id, client = %sock.peer, "client: remote side closed");
        let _ = sock.writer.lock().await.shutdown().await;
        let _ = sock.closed.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct ClientTcpServerOptions {
    pub listen_addr: String,
    pub remote_port: u16,
    pub relay_channel: String,
}

/// Accepts local TCP connections for one forwarding rule and pumps their bytes into the
/// multiplexer.
pub struct ClientTcpServer {
    opts: ClientTcpServerOptions,
    mux: Arc<dyn Multiplexer>,
    sockets: Arc<LocalSockets>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientTcpServer {
    pub fn new(
        opts: ClientTcpServerOptions,
        mux: Arc<dyn Multiplexer>,
        sockets: Arc<LocalSockets>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            opts,
            mux,
            sockets,
            shutdown,
            accept_task: Mutex::new(None),
        }
    }

    pub fn sockets(&self) -> Arc<LocalSockets> {
        self.sockets.clone()
    }

    /// Binds the local port and starts accepting. Returns the bound address.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("client: bind {}", self.opts.listen_addr))?;
        let local = ln.local_addr()?;

        tracing::info!(
            listen_addr = %local,
            remote_port = self.opts.remote_port,
            channel = %self.opts.relay_channel,
            "client: listening"
        );

        let task = tokio::spawn(accept_loop(
            ln,
            self.opts.remote_port,
            self.mux.clone(),
            self.sockets.clone(),
            self.shutdown.subscribe(),
        ));
        *self.accept_task.lock().await = Some(task);
        Ok(local)
    }

    pub async fn write_to_local(&self, id: ConnectionId, data: &[u8]) {
        self.sockets.write_to_local(id, data).await;
    }

    /// Stops accepting and asks every forwarding task to finish. Accepted sockets are not
    /// torn down here; each closes once its read loop sees the signal or EOF.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    ln: TcpListener,
    remote_port: u16,
    mux: Arc<dyn Multiplexer>,
    sockets: Arc<LocalSockets>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "client: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if *shutdown.borrow() {
                    break;
                }
                net::tune_stream(&conn);

                let id = ConnectionId::new();
                let (rd, wr) = conn.into_split();
                let (closed, closed_rx) = watch::channel(false);
                sockets
                    .table
                    .insert(
                        id,
                        Arc::new(LocalSocket {
                            peer,
                            writer: Mutex::new(wr),
                            closed,
                        }),
                    )
                    .await;

                metrics::counter!(telemetry::CONNECTIONS_TOTAL, "side" => "client").increment(1);
                metrics::gauge!(telemetry::ACTIVE_CONNECTIONS, "side" => "client").increment(1.0);
                tracing::debug!(conn = %id, client = %peer, "client: accepted");

                tokio::spawn(forward_local(
                    id,
                    rd,
                    remote_port,
                    mux.clone(),
                    sockets.clone(),
                    closed_rx,
                    shutdown.clone(),
                ));
            }
        }
    }
    tracing::info!("client: listener stopped");
}

/// Reads one local socket until EOF, error, remote close or shutdown, multiplexing every
/// non-empty read. Exactly one close signal is sent when the loop ends.
async fn forward_local(
    id: ConnectionId,
    mut rd: OwnedReadHalf,
    remote_port: u16,
    mux: Arc<dyn Multiplexer>,
    sockets: Arc<LocalSockets>,
    mut closed: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if *shutdown.borrow() {
            break;
        }
        let res = tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                // A retired id is never multiplexed again.
                break;
            }
            res = rd.read(&mut buf) => res,
        };
        match res {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = mux.multiplex(id, remote_port, &buf[..n]).await {
                    tracing::debug!(conn = %id, err = %err, "client: multiplex failed");
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(conn = %id, err = %err, "client: read from local failed");
                break;
            }
        }
    }

    mux.connection_closed(id).await;
    sockets.table.remove(&id).await;
    metrics::gauge!(telemetry::ACTIVE_CONNECTIONS, "side" => "client").decrement(1.0);
    tracing::debug!(conn = %id, "client: connection closed");
}
