//! Rendezvous hub for the `tcp` relay transport.
//!
//! Both bridges dial out to the hub. Server bridges park `listen` sockets per channel; a
//! client `connect` for the same channel is paired with one parked socket and the two are
//! spliced until either side closes.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{Mutex, watch},
};

use crate::portbridge::{config::RendezvousKey, net};

const MAGIC_HELLO: &[u8; 4] = b"PBRV"; // PortBridge RendezVous
const PROTOCOL_V1: u8 = 1;

pub const MAX_HELLO_JSON_BYTES: u32 = 64 * 1024;

pub const STATUS_OK: u8 = 0;
pub const STATUS_UNAUTHORIZED: u8 = 1;
pub const STATUS_NO_LISTENER: u8 = 2;
pub const STATUS_BAD_REQUEST: u8 = 3;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HelloError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("hello too large: {0}")]
    TooLarge(u32),
    #[error("empty channel")]
    EmptyChannel,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Listen,
    Connect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
    pub channel: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub key: String,
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, hello: &Hello) -> Result<(), HelloError> {
    if hello.channel.trim().is_empty() {
        return Err(HelloError::EmptyChannel);
    }
    w.write_all(MAGIC_HELLO).await?;
    w.write_u8(PROTOCOL_V1).await?;

    let b = serde_json::to_vec(hello)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, HelloError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_HELLO {
        return Err(HelloError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(HelloError::BadVersion);
    }

    let n = r.read_u32().await?;
    if n > MAX_HELLO_JSON_BYTES {
        return Err(HelloError::TooLarge(n));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    let mut hello: Hello = serde_json::from_slice(&buf)?;
    hello.channel = hello.channel.trim().to_string();
    if hello.channel.is_empty() {
        return Err(HelloError::EmptyChannel);
    }
    Ok(hello)
}

struct Hub {
    keys: HashMap<String, String>,
    pending: Mutex<HashMap<String, VecDeque<TcpStream>>>,
}

impl Hub {
    fn new(keys: &[RendezvousKey]) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|k| (k.name.clone(), k.key.clone()))
                .collect(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn authorized(&self, hello: &Hello) -> bool {
        if self.keys.is_empty() {
            return true;
        }
        self.keys
            .get(&hello.key_name)
            .is_some_and(|k| *k == hello.key)
    }

    async fn park(&self, channel: String, conn: TcpStream) {
        let mut pending = self.pending.lock().await;
        pending.entry(channel).or_default().push_back(conn);
    }

    /// Pops the newest live parked listener for `channel` and tells it it has been paired.
    async fn take_listener(&self, channel: &str) -> Option<TcpStream> {
        loop {
            let mut conn = {
                let mut pending = self.pending.lock().await;
                let q = pending.get_mut(channel)?;
                let c = q.pop_back();
                if q.is_empty() {
                    pending.remove(channel);
                }
                c?
            };

            // A parked listener never sends after its hello, so any readable state means
            // the peer went away.
            let mut peek = [0u8; 1];
            match conn.try_read(&mut peek) {
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                _ => continue,
            }

            if conn.write_u8(STATUS_OK).await.is_ok() {
                return Some(conn);
            }
        }
    }

    async fn handle(self: Arc<Self>, mut conn: TcpStream) -> anyhow::Result<()> {
        let hello = match read_hello(&mut conn).await {
            Ok(h) => h,
            Err(err) => {
                let _ = conn.write_u8(STATUS_BAD_REQUEST).await;
                return Err(err.into());
            }
        };

        if !self.authorized(&hello) {
            tracing::warn!(channel = %hello.channel, key_name = %hello.key_name, "rendezvous: bad credentials");
            let _ = conn.write_u8(STATUS_UNAUTHORIZED).await;
            return Ok(());
        }

        match hello.role {
            Role::Listen => {
                tracing::debug!(channel = %hello.channel, "rendezvous: listener parked");
                self.park(hello.channel, conn).await;
            }
            Role::Connect => {
                let Some(mut ln) = self.take_listener(&hello.channel).await else {
                    tracing::debug!(channel = %hello.channel, "rendezvous: no listener");
                    let _ = conn.write_u8(STATUS_NO_LISTENER).await;
                    return Ok(());
                };
                conn.write_u8(STATUS_OK).await?;
                tracing::debug!(channel = %hello.channel, "rendezvous: paired");
                let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut ln).await?;
                tracing::debug!(channel = %hello.channel, up, down, "rendezvous: splice ended");
            }
        }
        Ok(())
    }
}

pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("rendezvous: bind {listen_addr}"))?;
    tracing::info!(listen_addr = %bind_addr, "rendezvous: listening");
    Ok(ln)
}

/// Serves hub connections until shutdown. Accept errors are logged and retried after a
/// short pause; a single bad connection never ends the hub.
pub async fn serve_listener(
    ln: TcpListener,
    keys: &[RendezvousKey],
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let hub = Arc::new(Hub::new(keys));
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
                        tracing::warn!(err = %err, "rendezvous: accept failed");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                        }
                        continue;
                    }
                };
                net::tune_stream(&conn);
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(err) = hub.handle(conn).await {
                        tracing::debug!(peer = %peer, err = %err, "rendezvous: connection ended");
                    }
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_hub() -> (std::net::SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { serve_listener(ln, &[], rx).await });
        (addr, tx, task)
    }

    async fn status_for(addr: std::net::SocketAddr, hello: &[u8]) -> u8 {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(hello).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), s.read_u8())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn hub_keeps_serving_after_bad_connections() {
        let (addr, tx, task) = start_hub().await;

        assert_eq!(status_for(addr, b"JUNK").await, STATUS_BAD_REQUEST);
        drop(TcpStream::connect(addr).await.unwrap());

        let mut hello = Vec::new();
        write_hello(
            &mut hello,
            &Hello {
                role: Role::Connect,
                channel: "ssh".into(),
                key_name: String::new(),
                key: String::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(status_for(addr, &hello).await, STATUS_NO_LISTENER);
        assert!(!task.is_finished());

        let _ = tx.send(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn hello_roundtrip_trims_channel() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Hello {
            role: Role::Listen,
            channel: " ssh ".into(),
            key_name: "bridge".into(),
            key: "secret".into(),
        };
        write_hello(&mut a, &hello).await.unwrap();
        let got = read_hello(&mut b).await.unwrap();
        assert_eq!(got.role, Role::Listen);
        assert_eq!(got.channel, "ssh");
        assert_eq!(got.key_name, "bridge");
        assert_eq!(got.key, "secret");
    }

    #[tokio::test]
    async fn hello_rejects_oversized_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(MAGIC_HELLO).await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
            a.write_u32(MAX_HELLO_JSON_BYTES + 1).await.unwrap();
        });
        match read_hello(&mut b).await.unwrap_err() {
            HelloError::TooLarge(n) => assert!(n > MAX_HELLO_JSON_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_rejects_bad_magic() {
        let mut r = &b"NOPE\x01"[..];
        assert!(matches!(
            read_hello(&mut r).await.unwrap_err(),
            HelloError::BadMagic
        ));
    }

    #[test]
    fn open_hub_accepts_any_key_and_keyed_hub_checks() {
        let hello = Hello {
            role: Role::Connect,
            channel: "c".into(),
            key_name: "k".into(),
            key: "v".into(),
        };
        assert!(Hub::new(&[]).authorized(&hello));

        let keyed = Hub::new(&[RendezvousKey {
            name: "k".into(),
            key: "v".into(),
        }]);
        assert!(keyed.authorized(&hello));
        assert!(!keyed.authorized(&Hello {
            key: "wrong".into(),
            ..hello
        }));
    }
}
