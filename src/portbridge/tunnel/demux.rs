use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
};

use crate::portbridge::{
    net, telemetry,
    tunnel::{
        listener::ReplySink,
        protocol::{ConnectionId, READ_CHUNK, RelayStreamId},
        table::Table,
    },
};

/// Server-side sink for frames read off a relay stream.
#[async_trait]
pub trait Demultiplexer: Send + Sync {
    async fn demultiplex(
        &self,
        relay: RelayStreamId,
        id: ConnectionId,
        target_port: u16,
        data: Bytes,
    );

    /// Closes the target socket for `id`. Unknown ids are ignored.
    async fn connection_closed(&self, relay: RelayStreamId, id: ConnectionId);

    /// Closes every target socket owned by `relay`.
    async fn relay_stream_closed(&self, relay: RelayStreamId);
}

struct TargetConn {
    relay: RelayStreamId,
    port: u16,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetConnSnapshot {
    pub conn: ConnectionId,
    pub relay_stream: RelayStreamId,
    pub target_port: u16,
}

/// Maps each ConnectionId to an outbound socket on `target_hostname`.
pub struct ServerDemultiplexer {
    target_hostname: String,
    replies: Arc<dyn ReplySink>,
    conns: Arc<Table<ConnectionId, Arc<TargetConn>>>,
}

impl ServerDemultiplexer {
    pub fn new(target_hostname: impl Into<String>, replies: Arc<dyn ReplySink>) -> Self {
        Self {
            target_hostname: target_hostname.into(),
            replies,
            conns: Arc::new(Table::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.conns.len().await
    }

    pub async fn snapshot(&self) -> Vec<TargetConnSnapshot> {
        self.conns
            .snapshot()
            .await
            .into_iter()
            .map(|(conn, c)| TargetConnSnapshot {
                conn,
                relay_stream: c.relay,
                target_port: c.port,
            })
            .collect()
    }

    pub async fn close_all(&self) {
        for (id, conn) in self.conns.drain().await {
            close_target(id, &conn).await;
        }
    }

    fn target_addr(&self, port: u16) -> String {
        let host = self.target_hostname.as_str();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Dials the target and registers it unless another frame for `id` won the race first.
    /// Returns whichever connection owns `id` afterwards.
    async fn open(
        &self,
        relay: RelayStreamId,
        id: ConnectionId,
        port: u16,
    ) -> Option<Arc<TargetConn>> {
        let addr = self.target_addr(port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(conn = %id, relay_stream = %relay, target = %addr, err = %err, "demux: target connect failed");
                self.notify_remote_closed(relay, id).await;
                return None;
            }
        };
        net::tune_stream(&stream);

        let (rd, wr) = stream.into_split();
        let (closed, closed_rx) = watch::channel(false);
        let conn = Arc::new(TargetConn {
            relay,
            port,
            writer: Mutex::new(wr),
            closed,
        });

        match self.conns.insert_if_absent(id, conn.clone()).await {
            Ok(()) => {
                metrics::counter!(telemetry::CONNECTIONS_TOTAL, "side" => "server").increment(1);
                metrics::gauge!(telemetry::ACTIVE_CONNECTIONS, "side" => "server").increment(1.0);
                tracing::debug!(conn = %id, relay_stream = %relay, target = %addr, "demux: target connected");
                tokio::spawn(read_target(
                    id,
                    rd,
                    conn.clone(),
                    closed_rx,
                    self.replies.clone(),
                    self.conns.clone(),
                ));
                Some(conn)
            }
            Err(winner) => {
                tracing::debug!(conn = %id, "demux: lost creation race; discarding socket");
                Some(winner)
            }
        }
    }

    async fn notify_remote_closed(&self, relay: RelayStreamId, id: ConnectionId) {
        if let Err(err) = self.replies.write_reply(relay, id, &[]).await {
            tracing::debug!(conn = %id, err = %err, "demux: remote close not delivered");
        }
    }
}

#[async_trait]
impl Demultiplexer for ServerDemultiplexer {
    async fn demultiplex(
        &self,
        relay: RelayStreamId,
        id: ConnectionId,
        target_port: u16,
        data: Bytes,
    ) {
        let conn = match self.conns.get(&id).await {
            Some(c) => c,
            None => match self.open(relay, id, target_port).await {
                Some(c) => c,
                None => return,
            },
        };

        let mut w = conn.writer.lock().await;
        let res = async {
            w.write_all(&data).await?;
            w.flush().await
        }
        .await;
        if let Err(err) = res {
            // The entry stays; only the target reader retires it.
            tracing::debug!(conn = %id, err = %err, "demux: write to target failed");
            return;
        }
        metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "to_target")
            .increment(data.len() as u64);
    }

    async fn connection_closed(&self, _relay: RelayStreamId, id: ConnectionId) {
        if let Some(conn) = self.conns.remove(&id).await {
            tracing::debug!(conn = %id, "demux: closed by client");
            close_target(id, &conn).await;
        }
    }

    async fn relay_stream_closed(&self, relay: RelayStreamId) {
        let orphans = self.conns.remove_where(|_, c| c.relay == relay).await;
        if !orphans.is_empty() {
            tracing::info!(relay_stream = %relay, count = orphans.len(), "demux: closing connections of retired relay stream");
        }
        for (id, conn) in orphans {
            close_target(id, &conn).await;
        }
    }
}

async fn close_target(id: ConnectionId, conn: &TargetConn) {
    let _ = conn.closed.send(true);
    if let Err(err) = conn.writer.lock().await.shutdown().await {
        tracing::debug!(conn = %id, err = %err, "demux: target shutdown failed");
    }
}

/// Copies target bytes back as replies until EOF, error, or a close from the client side.
/// A target-side ending is reported with a zero-length reply.
async fn read_target(
    id: ConnectionId,
    mut rd: OwnedReadHalf,
    conn: Arc<TargetConn>,
    mut closed: watch::Receiver<bool>,
    replies: Arc<dyn ReplySink>,
    conns: Arc<Table<ConnectionId, Arc<TargetConn>>>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let target_ended = loop {
        tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break false,
            res = rd.read(&mut buf) => match res {
                Ok(0) => break true,
                Ok(n) => {
                    if let Err(err) = replies.write_reply(conn.relay, id, &buf[..n]).await {
                        tracing::debug!(conn = %id, err = %err, "demux: reply failed");
                        break false;
                    }
                    metrics::counter!(telemetry::BYTES_TOTAL, "direction" => "from_target")
                        .increment(n as u64);
                }
                Err(err) => {
                    tracing::debug!(conn = %id, err = %err, "demux: read from target failed");
                    break true;
                }
            },
        }
    };

    let owned = conns
        .remove_if(&id, |c| Arc::ptr_eq(c, &conn))
        .await
        .is_some();
    if owned {
        close_target(id, &conn).await;
        if target_ended {
            if let Err(err) = replies.write_reply(conn.relay, id, &[]).await {
                tracing::debug!(conn = %id, err = %err, "demux: remote close not delivered");
            }
        }
    }
    metrics::gauge!(telemetry::ACTIVE_CONNECTIONS, "side" => "server").decrement(1.0);
    tracing::debug!(conn = %id, target_ended, "demux: target connection retired");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::portbridge::tunnel::listener::ReplyError;

    #[derive(Default)]
    struct RecordingReplies {
        replies: std::sync::Mutex<Vec<(RelayStreamId, ConnectionId, Vec<u8>)>>,
    }

    impl RecordingReplies {
        fn replies(&self) -> Vec<(RelayStreamId, ConnectionId, Vec<u8>)> {
            self.replies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplySink for RecordingReplies {
        async fn write_reply(
            &self,
            relay: RelayStreamId,
            id: ConnectionId,
            data: &[u8],
        ) -> Result<(), ReplyError> {
            self.replies
                .lock()
                .unwrap()
                .push((relay, id, data.to_vec()));
            Ok(())
        }
    }

    async fn eventually<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn target() -> (TcpListener, u16) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        (ln, port)
    }

    async fn accept(ln: &TcpListener) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .unwrap()
            .unwrap()
            .0
    }

    async fn read_exactly(s: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(2), s.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn first_frame_opens_target_and_later_frames_reuse_it() {
        let (ln, port) = target().await;
        let replies = Arc::new(RecordingReplies::default());
        let demux = ServerDemultiplexer::new("127.0.0.1", replies.clone());
        let relay = RelayStreamId::new();
        let id = ConnectionId::new();

        demux.demultiplex(relay, id, port, Bytes::from_static(b"PI")).await;
        let mut t = accept(&ln).await;
        demux.demultiplex(relay, id, port, Bytes::from_static(b"NG")).await;
        assert_eq!(read_exactly(&mut t, 4).await, b"PING");
        assert_eq!(demux.len().await, 1);

        t.write_all(b"PONG").await.unwrap();
        eventually(|| !replies.replies().is_empty()).await;
        assert_eq!(replies.replies()[0], (relay, id, b"PONG".to_vec()));

        // No second connection was dialed.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), ln.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn target_eof_sends_remote_close_and_retires_entry() {
        let (ln, port) = target().await;
        let replies = Arc::new(RecordingReplies::default());
        let demux = ServerDemultiplexer::new("127.0.0.1", replies.clone());
        let relay = RelayStreamId::new();
        let id = ConnectionId::new();

        demux.demultiplex(relay, id, port, Bytes::from_static(b"x")).await;
        drop(accept(&ln).await);

        eventually(|| replies.replies().iter().any(|r| r.2.is_empty())).await;
        assert_eq!(replies.replies().last().unwrap(), &(relay, id, Vec::new()));
        for _ in 0..200 {
            if demux.len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(demux.len().await, 0);
    }

    #[tokio::test]
    async fn close_signal_closes_target_and_is_idempotent() {
        let (ln, port) = target().await;
        let replies = Arc::new(RecordingReplies::default());
        let demux = ServerDemultiplexer::new("127.0.0.1", replies.clone());
        let relay = RelayStreamId::new();
        let id = ConnectionId::new();

        demux.demultiplex(relay, id, port, Bytes::from_static(b"x")).await;
        let mut t = accept(&ln).await;
        assert_eq!(read_exactly(&mut t, 1).await, b"x");

        demux.connection_closed(relay, id).await;
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), t.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(demux.len().await, 0);

        demux.connection_closed(relay, id).await;
        demux.connection_closed(relay, ConnectionId::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A client-initiated close does not echo a remote close.
        assert!(replies.replies().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_reports_remote_close() {
        let (ln, port) = target().await;
        drop(ln);
        let replies = Arc::new(RecordingReplies::default());
        let demux = ServerDemultiplexer::new("127.0.0.1", replies.clone());
        let relay = RelayStreamId::new();
        let id = ConnectionId::new();

        demux.demultiplex(relay, id, port, Bytes::from_static(b"x")).await;
        assert_eq!(demux.len().await, 0);
        assert_eq!(replies.replies(), vec![(relay, id, Vec::new())]);
    }

    #[tokio::test]
    async fn concurrent_first_frames_share_one_target() {
        let (ln, port) = target().await;
        let replies = Arc::new(RecordingReplies::default());
        let demux = Arc::new(ServerDemultiplexer::new("127.0.0.1", replies));
        let relay = RelayStreamId::new();
        let id = ConnectionId::new();

        let received: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let collector = {
            let received = received.clone();
            tokio::spawn(async move {
                let mut i = 0;
                loop {
                    let (mut s, _) = ln.accept().await.unwrap();
                    received.lock().unwrap().push(Vec::new());
                    let received = received.clone();
                    let slot = i;
                    i += 1;
                    tokio::spawn(async move {
                        let mut buf = [0u8; 64];
                        while let Ok(n) = s.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                            received.lock().unwrap()[slot].extend_from_slice(&buf[..n]);
                        }
                    });
                }
            })
        };

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let demux = demux.clone();
            tasks.push(tokio::spawn(async move {
                demux.demultiplex(relay, id, port, Bytes::from_static(b"d")).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        eventually(|| received.lock().unwrap().iter().map(Vec::len).sum::<usize>() == 8).await;
        let with_data = received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.is_empty())
            .count();
        assert_eq!(with_data, 1);
        assert_eq!(demux.len().await, 1);
        collector.abort();
    }

    #[tokio::test]
    async fn relay_stream_closed_only_touches_its_connections() {
        let (ln, port) = target().await;
        let replies = Arc::new(RecordingReplies::default());
        let demux = ServerDemultiplexer::new("127.0.0.1", replies);
        let (r1, r2) = (RelayStreamId::new(), RelayStreamId::new());
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        demux.demultiplex(r1, a, port, Bytes::from_static(b"a")).await;
        let mut ta = accept(&ln).await;
        demux.demultiplex(r2, b, port, Bytes::from_static(b"b")).await;
        let mut tb = accept(&ln).await;
        read_exactly(&mut ta, 1).await;
        read_exactly(&mut tb, 1).await;

        demux.relay_stream_closed(r1).await;
        let mut buf = [0u8; 1];
        assert_eq!(ta.read(&mut buf).await.unwrap(), 0);

        let snap = demux.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].conn, b);
        demux.demultiplex(r2, b, port, Bytes::from_static(b"!")).await;
        assert_eq!(read_exactly(&mut tb, 1).await, b"!");
    }
}
