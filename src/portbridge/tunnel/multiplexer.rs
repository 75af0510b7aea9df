use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
};

use crate::portbridge::{
    telemetry,
    tunnel::{
        client::LocalSink,
        protocol::{self, ConnectionId, ProtocolError},
        table::Table,
        transport::{BoxedStream, RelayTransport},
    },
};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("no relay stream available")]
    NoRelayStream,
    #[error("relay stream carrying this connection was lost")]
    StreamLost,
    #[error("multiplexer stopped")]
    Stopped,
    #[error("relay write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client-side sink for local socket traffic.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn multiplex(
        &self,
        id: ConnectionId,
        remote_port: u16,
        data: &[u8],
    ) -> Result<(), MuxError>;

    /// Best effort: failures are logged, never returned.
    async fn connection_closed(&self, id: ConnectionId);
}

struct RelayWriter {
    generation: u64,
    half: WriteHalf<BoxedStream>,
}

type RelaySlot = Arc<Mutex<Option<RelayWriter>>>;

/// ConnectionId -> generation of the relay stream that carried its first frame.
type Bindings = Arc<Table<ConnectionId, u64>>;

/// Serializes every local connection of one rule onto a single relay stream.
///
/// The stream is opened lazily and cached. A failed open or write leaves the slot empty so
/// the next frame reopens it; there is no backoff. Each opened stream gets its own reader
/// loop, which empties the slot when it ends if the slot still holds that stream.
///
/// A connection is bound to the stream generation its first frame went out on. When that
/// stream is lost, every connection bound to it is reported closed to the local sink and
/// its later frames fail with [`MuxError::StreamLost`]; only new connections move to the
/// next stream.
pub struct ClientMultiplexer {
    channel: String,
    transport: Arc<dyn RelayTransport>,
    sink: Arc<dyn LocalSink>,
    stream: RelaySlot,
    bound: Bindings,
    generation: AtomicU64,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ClientMultiplexer {
    pub fn new(
        channel: impl Into<String>,
        transport: Arc<dyn RelayTransport>,
        sink: Arc<dyn LocalSink>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            transport,
            sink,
            stream: Arc::new(Mutex::new(None)),
            bound: Arc::new(Table::new()),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Opens the first relay stream up front. Failure is only logged; the first frame
    /// retries.
    pub async fn start(&self) {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            if let Ok(w) = self.open_stream().await {
                *slot = Some(w);
            }
        }
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        if let Some(mut w) = self.stream.lock().await.take() {
            if let Err(err) = w.half.shutdown().await {
                tracing::debug!(channel = %self.channel, err = %err, "mux: relay shutdown failed");
            }
        }
        tracing::info!(channel = %self.channel, "mux: stopped");
    }

    async fn open_stream(&self) -> Result<RelayWriter, MuxError> {
        let stream = match self.transport.connect(&self.channel).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(
                    channel = %self.channel,
                    transport = self.transport.name(),
                    err = %err,
                    "mux: open relay stream failed"
                );
                return Err(MuxError::NoRelayStream);
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (rd, wr) = tokio::io::split(stream);

        tokio::spawn(read_replies(
            rd,
            generation,
            self.channel.clone(),
            self.sink.clone(),
            self.stream.clone(),
            self.bound.clone(),
            self.shutdown.subscribe(),
        ));

        tracing::info!(channel = %self.channel, generation, "mux: relay stream opened");
        Ok(RelayWriter {
            generation,
            half: wr,
        })
    }

    /// Writes one complete frame for `id` under the stream lock.
    ///
    /// Only a frame that starts a connection (`opens`) may open a stream or bind `id`. A
    /// close for an id that never went out is dropped.
    async fn send_frame(
        &self,
        id: ConnectionId,
        frame: &[u8],
        opens: bool,
    ) -> Result<(), MuxError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MuxError::Stopped);
        }
        let bound = self.bound.get(&id).await;
        let mut slot = self.stream.lock().await;
        match bound {
            Some(g) if slot.as_ref().map(|w| w.generation) != Some(g) => {
                return Err(MuxError::StreamLost);
            }
            None if !opens => return Ok(()),
            _ => {}
        }
        if slot.is_none() {
            *slot = Some(self.open_stream().await?);
        }
        let Some(w) = slot.as_mut() else {
            return Err(MuxError::NoRelayStream);
        };
        let generation = w.generation;

        let res = async {
            w.half.write_all(frame).await?;
            w.half.flush().await
        }
        .await;

        if let Err(err) = res {
            tracing::warn!(
                channel = %self.channel,
                generation,
                err = %err,
                "mux: relay write failed; dropping stream"
            );
            if let Some(mut dead) = slot.take() {
                let _ = dead.half.shutdown().await;
            }
            drop(slot);
            orphan_generation(generation, &self.channel, &self.bound, self.sink.as_ref()).await;
            return Err(MuxError::Write(err));
        }
        if bound.is_none() {
            // Bound while the slot is still held, so a reader exiting for this
            // generation sees the binding.
            self.bound.insert(id, generation).await;
        }
        metrics::counter!(telemetry::FRAMES_TOTAL, "direction" => "to_relay").increment(1);
        Ok(())
    }
}

#[async_trait]
impl Multiplexer for ClientMultiplexer {
    async fn multiplex(
        &self,
        id: ConnectionId,
        remote_port: u16,
        data: &[u8],
    ) -> Result<(), MuxError> {
        let frame = protocol::encode_forward(id, i32::from(remote_port), data)?;
        self.send_frame(id, &frame, true).await?;
        metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "to_relay")
            .increment(data.len() as u64);
        Ok(())
    }

    async fn connection_closed(&self, id: ConnectionId) {
        if let Err(err) = self.send_frame(id, &protocol::encode_close(id), false).await {
            tracing::debug!(conn = %id, channel = %self.channel, err = %err, "mux: close signal not sent");
        }
        self.bound.remove(&id).await;
    }
}

/// Reports every connection bound to a lost stream generation as closed. The bindings
/// stay until each connection's close signal arrives, so late frames keep failing.
async fn orphan_generation(
    generation: u64,
    channel: &str,
    bound: &Bindings,
    sink: &dyn LocalSink,
) {
    let orphans: Vec<ConnectionId> = bound
        .snapshot()
        .await
        .into_iter()
        .filter(|(_, g)| *g == generation)
        .map(|(id, _)| id)
        .collect();
    if !orphans.is_empty() {
        tracing::info!(channel = %channel, generation, count = orphans.len(), "mux: closing connections of lost relay stream");
    }
    for id in orphans {
        sink.remote_closed(id).await;
    }
}

async fn read_replies(
    mut rd: ReadHalf<BoxedStream>,
    generation: u64,
    channel: String,
    sink: Arc<dyn LocalSink>,
    slot: RelaySlot,
    bound: Bindings,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            res = protocol::read_reply(&mut rd) => res,
        };
        match frame {
            Ok(Some(reply)) => {
                metrics::counter!(telemetry::FRAMES_TOTAL, "direction" => "from_relay")
                    .increment(1);
                if reply.payload.is_empty() {
                    sink.remote_closed(reply.id).await;
                } else {
                    sink.write_to_local(reply.id, &reply.payload).await;
                }
            }
            Ok(None) => {
                tracing::info!(channel = %channel, generation, "mux: relay stream closed by peer");
                break;
            }
            Err(err) => {
                tracing::warn!(channel = %channel, generation, err = %err, "mux: relay read failed");
                break;
            }
        }
    }

    {
        let mut slot = slot.lock().await;
        if slot.as_ref().is_some_and(|w| w.generation == generation) {
            if let Some(mut w) = slot.take() {
                let _ = w.half.shutdown().await;
            }
        }
    }
    orphan_generation(generation, &channel, &bound, sink.as_ref()).await;
}
