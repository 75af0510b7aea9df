use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::portbridge::config::RelayConfig;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// One relay stream: reads return 0 at end-of-stream, `shutdown()` is the graceful close.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct RelayCredentials {
    pub key_name: String,
    pub key: String,
}

/// Obtains relay streams for named channels. Instances carry the relay endpoint and
/// credentials; the tunnel core only ever sees streams.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn name(&self) -> &'static str;
    /// Opens a new relay stream to whoever listens on `channel`.
    async fn connect(&self, channel: &str) -> anyhow::Result<BoxedStream>;
    async fn listen(&self, channel: &str) -> anyhow::Result<Arc<dyn RelayListener>>;
}

#[async_trait]
pub trait RelayListener: Send + Sync {
    /// Waits for the next relay stream. `Ok(None)` once the listener is closed.
    async fn accept(&self) -> anyhow::Result<Option<BoxedStream>>;
    async fn close(&self);
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" => Ok(n),
        _ => anyhow::bail!("relay: unknown transport {name:?} (expected tcp)"),
    }
}

pub mod tcp;

#[cfg(test)]
pub mod memory;

pub fn transport_from_config(cfg: &RelayConfig) -> anyhow::Result<Arc<dyn RelayTransport>> {
    let n = parse_transport(&cfg.transport)?;
    if cfg.namespace.trim().is_empty() {
        anyhow::bail!("relay: namespace is required");
    }
    let creds = RelayCredentials {
        key_name: cfg.key_name.clone(),
        key: cfg.key.clone(),
    };
    let dial_timeout = if cfg.dial_timeout.is_zero() {
        Duration::from_secs(5)
    } else {
        cfg.dial_timeout
    };
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::RendezvousTransport::new(
            cfg.namespace.clone(),
            creds,
            dial_timeout,
        ))),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transport_defaults_and_rejects() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert!(parse_transport("quic").is_err());
    }

    #[test]
    fn transport_requires_namespace() {
        let cfg = RelayConfig {
            transport: "tcp".into(),
            namespace: " ".into(),
            key_name: String::new(),
            key: String::new(),
            dial_timeout: Duration::ZERO,
        };
        assert!(transport_from_config(&cfg).is_err());

        let cfg = RelayConfig {
            namespace: "127.0.0.1:9350".into(),
            ..cfg
        };
        assert_eq!(transport_from_config(&cfg).unwrap().name(), "tcp");
    }
}
