use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::portbridge::tunnel::transport::{BoxedStream, RelayListener, RelayTransport};

const PIPE_BYTES: usize = 256 * 1024;

/// In-process relay: `connect` hands one end of a duplex pipe to a listener of the same
/// channel, rotating across listeners when several are registered.
#[derive(Default)]
pub struct MemoryRelay {
    channels: Arc<Mutex<HashMap<String, Vec<(usize, mpsc::Sender<BoxedStream>)>>>>,
    next_id: AtomicUsize,
    rotate: AtomicUsize,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, channel: &str) -> anyhow::Result<BoxedStream> {
        let tx = {
            let chans = self.channels.lock().await;
            let listeners = chans
                .get(channel)
                .filter(|l| !l.is_empty())
                .ok_or_else(|| anyhow::anyhow!("memory relay: no listener for {channel:?}"))?;
            let i = self.rotate.fetch_add(1, Ordering::Relaxed) % listeners.len();
            listeners[i].1.clone()
        };
        let (ours, theirs) = tokio::io::duplex(PIPE_BYTES);
        tx.send(Box::new(theirs))
            .await
            .map_err(|_| anyhow::anyhow!("memory relay: listener for {channel:?} closed"))?;
        Ok(Box::new(ours))
    }

    async fn listen(&self, channel: &str) -> anyhow::Result<Arc<dyn RelayListener>> {
        let (tx, rx) = mpsc::channel(16);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        Ok(Arc::new(MemoryListener {
            id,
            channel: channel.to_string(),
            channels: self.channels.clone(),
            rx: Mutex::new(rx),
        }))
    }
}

struct MemoryListener {
    id: usize,
    channel: String,
    channels: Arc<Mutex<HashMap<String, Vec<(usize, mpsc::Sender<BoxedStream>)>>>>,
    rx: Mutex<mpsc::Receiver<BoxedStream>>,
}

#[async_trait]
impl RelayListener for MemoryListener {
    async fn accept(&self) -> anyhow::Result<Option<BoxedStream>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        if let Some(l) = self.channels.lock().await.get_mut(&self.channel) {
            // Dropping the registered sender ends `accept` once queued streams drain.
            l.retain(|(id, _)| *id != self.id);
        }
    }
}
