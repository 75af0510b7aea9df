use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
    task::{JoinHandle, JoinSet},
};

use crate::portbridge::{
    telemetry,
    tunnel::{
        demux::Demultiplexer,
        protocol::{self, ClientHeader, ConnectionId, ProtocolError, RelayStreamId},
        table::Table,
        transport::{BoxedStream, RelayListener, RelayTransport},
    },
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("relay stream {0} is gone")]
    StreamGone(RelayStreamId),
    #[error("relay write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Route back to the client for bytes read from a target socket.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn write_reply(
        &self,
        relay: RelayStreamId,
        id: ConnectionId,
        data: &[u8],
    ) -> Result<(), ReplyError>;
}

struct RelayStream {
    writer: Mutex<WriteHalf<BoxedStream>>,
}

/// Write halves of the accepted relay streams, keyed by RelayStreamId.
pub struct RelayStreams {
    table: Table<RelayStreamId, Arc<RelayStream>>,
}

impl RelayStreams {
    pub fn new() -> Self {
        Self {
            table: Table::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.table.len().await
    }

    async fn register(&self, id: RelayStreamId, wr: WriteHalf<BoxedStream>) {
        self.table
            .insert(
                id,
                Arc::new(RelayStream {
                    writer: Mutex::new(wr),
                }),
            )
            .await;
    }

    async fn retire(&self, id: RelayStreamId) {
        if let Some(s) = self.table.remove(&id).await {
            shutdown_stream(id, &s).await;
        }
    }

    async fn retire_all(&self) {
        for (id, s) in self.table.drain().await {
            shutdown_stream(id, &s).await;
        }
    }
}

async fn shutdown_stream(id: RelayStreamId, s: &RelayStream) {
    if let Err(err) = s.writer.lock().await.shutdown().await {
        tracing::debug!(relay_stream = %id, err = %err, "relay: shutdown failed");
    }
}

#[async_trait]
impl ReplySink for RelayStreams {
    async fn write_reply(
        &self,
        relay: RelayStreamId,
        id: ConnectionId,
        data: &[u8],
    ) -> Result<(), ReplyError> {
        let Some(s) = self.table.get(&relay).await else {
            tracing::warn!(relay_stream = %relay, conn = %id, "relay: reply for closed relay stream dropped");
            return Err(ReplyError::StreamGone(relay));
        };
        let frame = protocol::encode_reply(id, data)?;
        let mut w = s.writer.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        metrics::counter!(telemetry::FRAMES_TOTAL, "direction" => "to_relay").increment(1);
        metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "to_relay")
            .increment(data.len() as u64);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerRelayListenerOptions {
    pub relay_channel: String,
    pub allowed_ports: BTreeSet<u16>,
    pub instance: usize,
}

/// Accepts relay streams on one channel and feeds their frames to a demultiplexer.
pub struct ServerRelayListener {
    opts: ServerRelayListenerOptions,
    transport: Arc<dyn RelayTransport>,
    demux: Arc<dyn Demultiplexer>,
    streams: Arc<RelayStreams>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<Arc<dyn RelayListener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRelayListener {
    pub fn new(
        opts: ServerRelayListenerOptions,
        transport: Arc<dyn RelayTransport>,
        demux: Arc<dyn Demultiplexer>,
        streams: Arc<RelayStreams>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            opts,
            transport,
            demux,
            streams,
            shutdown,
            listener: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.opts.relay_channel
    }

    pub fn streams(&self) -> Arc<RelayStreams> {
        self.streams.clone()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let ln = self
            .transport
            .listen(&self.opts.relay_channel)
            .await
            .with_context(|| format!("relay: listen on channel {:?}", self.opts.relay_channel))?;
        *self.listener.lock().await = Some(ln.clone());

        tracing::info!(
            channel = %self.opts.relay_channel,
            instance = self.opts.instance,
            transport = self.transport.name(),
            allowed_ports = ?self.opts.allowed_ports,
            "relay: listening"
        );

        let task = tokio::spawn(accept_loop(
            ln,
            self.opts.clone(),
            self.demux.clone(),
            self.streams.clone(),
            self.shutdown.subscribe(),
        ));
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Ends every accept and reader loop, then shuts down any relay stream still tracked.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(ln) = self.listener.lock().await.take() {
            ln.close().await;
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        self.streams.retire_all().await;
        tracing::info!(
            channel = %self.opts.relay_channel,
            instance = self.opts.instance,
            "relay: stopped"
        );
    }
}

async fn accept_loop(
    ln: Arc<dyn RelayListener>,
    opts: ServerRelayListenerOptions,
    demux: Arc<dyn Demultiplexer>,
    streams: Arc<RelayStreams>,
    mut shutdown: watch::Receiver<bool>,
) {
    let allowed = Arc::new(opts.allowed_ports);
    let mut tasks = JoinSet::new();

    loop {
        let has_tasks = !tasks.is_empty();
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = tasks.join_next(), if has_tasks => {}
            res = ln.accept() => match res {
                Ok(Some(stream)) => {
                    let relay = RelayStreamId::new();
                    tracing::info!(channel = %opts.relay_channel, relay_stream = %relay, "relay: stream accepted");
                    tasks.spawn(serve_stream(
                        relay,
                        stream,
                        allowed.clone(),
                        demux.clone(),
                        streams.clone(),
                        shutdown.clone(),
                    ));
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(channel = %opts.relay_channel, err = %err, "relay: accept failed");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            },
        }
    }

    while tasks.join_next().await.is_some() {}
}

/// Reader loop for one relay stream. Any exit retires the stream and every target
/// connection it owns.
async fn serve_stream(
    relay: RelayStreamId,
    stream: BoxedStream,
    allowed: Arc<BTreeSet<u16>>,
    demux: Arc<dyn Demultiplexer>,
    streams: Arc<RelayStreams>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut rd, wr) = tokio::io::split(stream);
    streams.register(relay, wr).await;
    metrics::gauge!(telemetry::RELAY_STREAMS_ACTIVE).increment(1.0);

    read_frames(relay, &mut rd, &allowed, demux.as_ref(), &mut shutdown).await;

    streams.retire(relay).await;
    demux.relay_stream_closed(relay).await;
    metrics::gauge!(telemetry::RELAY_STREAMS_ACTIVE).decrement(1.0);
    tracing::info!(relay_stream = %relay, "relay: stream closed");
}

async fn read_frames(
    relay: RelayStreamId,
    rd: &mut ReadHalf<BoxedStream>,
    allowed: &BTreeSet<u16>,
    demux: &dyn Demultiplexer,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let header = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            res = protocol::read_client_header(rd) => res,
        };

        match header {
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(relay_stream = %relay, err = %err, "relay: bad frame");
                return;
            }
            Ok(Some(ClientHeader::Forward {
                id,
                remote_port,
                len,
            })) => {
                let Some(port) = u16::try_from(remote_port)
                    .ok()
                    .filter(|p| allowed.contains(p))
                else {
                    // Rejection tears down the whole relay stream.
                    metrics::counter!(telemetry::REJECTED_PORTS_TOTAL).increment(1);
                    tracing::warn!(
                        relay_stream = %relay,
                        conn = %id,
                        port = remote_port,
                        "relay: target port not allowed; closing relay stream"
                    );
                    return;
                };
                let payload = match protocol::read_payload(rd, len).await {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(relay_stream = %relay, conn = %id, err = %err, "relay: bad payload");
                        return;
                    }
                };
                metrics::counter!(telemetry::FRAMES_TOTAL, "direction" => "from_relay")
                    .increment(1);
                metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "from_relay")
                    .increment(payload.len() as u64);
                demux.demultiplex(relay, id, port, payload).await;
            }
            Ok(Some(ClientHeader::Close { id })) => {
                metrics::counter!(telemetry::FRAMES_TOTAL, "direction" => "from_relay")
                    .increment(1);
                demux.connection_closed(relay, id).await;
            }
        }
    }
}
