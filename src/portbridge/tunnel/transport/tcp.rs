use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, net::TcpStream};

use crate::portbridge::{
    net,
    tunnel::{
        rendezvous::{self, Hello, Role},
        transport::{BoxedStream, RelayCredentials, RelayListener, RelayTransport},
    },
};

/// Relay transport backed by the rendezvous hub: both sides dial out to `hub_addr`.
pub struct RendezvousTransport {
    hub_addr: String,
    creds: RelayCredentials,
    dial_timeout: Duration,
}

impl RendezvousTransport {
    pub fn new(hub_addr: String, creds: RelayCredentials, dial_timeout: Duration) -> Self {
        Self {
            hub_addr,
            creds,
            dial_timeout,
        }
    }
}

#[async_trait]
impl RelayTransport for RendezvousTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, channel: &str) -> anyhow::Result<BoxedStream> {
        let dial = dial_hub(&self.hub_addr, &self.creds, Role::Connect, channel);
        let st = tokio::time::timeout(self.dial_timeout, dial)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "relay: connect to {} timed out after {}",
                    self.hub_addr,
                    humantime::format_duration(self.dial_timeout)
                )
            })??;
        Ok(Box::new(st))
    }

    async fn listen(&self, channel: &str) -> anyhow::Result<Arc<dyn RelayListener>> {
        if channel.trim().is_empty() {
            anyhow::bail!("relay: empty channel");
        }
        Ok(Arc::new(RendezvousListener {
            hub_addr: self.hub_addr.clone(),
            creds: self.creds.clone(),
            channel: channel.trim().to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RendezvousListener {
    hub_addr: String,
    creds: RelayCredentials,
    channel: String,
    closed: AtomicBool,
}

#[async_trait]
impl RelayListener for RendezvousListener {
    async fn accept(&self) -> anyhow::Result<Option<BoxedStream>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        // Parks one socket at the hub and waits (without a deadline) to be paired.
        let st = dial_hub(&self.hub_addr, &self.creds, Role::Listen, &self.channel).await?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(Box::new(st)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

async fn dial_hub(
    hub_addr: &str,
    creds: &RelayCredentials,
    role: Role,
    channel: &str,
) -> anyhow::Result<TcpStream> {
    let mut st = TcpStream::connect(hub_addr).await?;
    net::tune_stream(&st);

    let hello = Hello {
        role,
        channel: channel.to_string(),
        key_name: creds.key_name.clone(),
        key: creds.key.clone(),
    };
    rendezvous::write_hello(&mut st, &hello).await?;

    let status = st.read_u8().await?;
    match status {
        rendezvous::STATUS_OK => Ok(st),
        rendezvous::STATUS_UNAUTHORIZED => {
            anyhow::bail!("relay: {hub_addr} rejected credentials for channel {channel:?}")
        }
        rendezvous::STATUS_NO_LISTENER => {
            anyhow::bail!("relay: no listener connected for channel {channel:?}")
        }
        other => anyhow::bail!("relay: {hub_addr} refused channel {channel:?} (status {other})"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::portbridge::config::RendezvousKey;

    async fn start_hub(keys: Vec<RendezvousKey>) -> (String, tokio::sync::watch::Sender<bool>) {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move { rendezvous::serve_listener(ln, &keys, rx).await });
        (addr, tx)
    }

    fn transport(addr: &str, key: &str) -> RendezvousTransport {
        RendezvousTransport::new(
            addr.to_string(),
            RelayCredentials {
                key_name: "bridge".into(),
                key: key.into(),
            },
            Duration::from_secs(2),
        )
    }

    async fn connect_with_retry(tr: &RendezvousTransport, channel: &str) -> BoxedStream {
        for _ in 0..50 {
            if let Ok(st) = tr.connect(channel).await {
                return st;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("listener never parked");
    }

    #[tokio::test]
    async fn connect_is_paired_with_parked_listener() {
        let (addr, _hub) = start_hub(vec![]).await;
        let tr = Arc::new(transport(&addr, ""));

        let ln = tr.listen("ssh").await.unwrap();
        let accept = tokio::spawn(async move { ln.accept().await.unwrap().unwrap() });

        let mut client = connect_with_retry(&tr, "ssh").await;
        let mut server = accept.await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        client.shutdown().await.unwrap();
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let (addr, _hub) = start_hub(vec![]).await;
        let Err(err) = transport(&addr, "").connect("nobody").await else {
            panic!("connect without a listener succeeded");
        };
        assert!(err.to_string().contains("no listener"), "got {err:#}");
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let (addr, _hub) = start_hub(vec![RendezvousKey {
            name: "bridge".into(),
            key: "secret".into(),
        }])
        .await;
        let Err(err) = transport(&addr, "wrong").connect("ssh").await else {
            panic!("connect with bad credentials succeeded");
        };
        assert!(err.to_string().contains("rejected credentials"), "got {err:#}");

        let ln = transport(&addr, "wrong").listen("ssh").await.unwrap();
        assert!(ln.accept().await.is_err());
    }

    #[tokio::test]
    async fn closed_listener_accepts_nothing() {
        let tr = transport("127.0.0.1:1", "");
        let ln = tr.listen("ssh").await.unwrap();
        ln.close().await;
        assert!(ln.accept().await.unwrap().is_none());
    }
}
