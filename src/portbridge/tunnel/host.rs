//! Wiring of the four tunnel components into the two bridge roles.
//!
//! A client host runs one multiplexer and one local TCP server per client rule. A server host
//! runs `instance_count` relay listeners per server rule, each with its own demultiplexer.

use std::{net::SocketAddr, sync::Arc};

use serde::Serialize;

use crate::portbridge::{
    config::{ClientRule, ServerRule},
    tunnel::{
        client::{ClientTcpServer, ClientTcpServerOptions, LocalSockets},
        demux::{ServerDemultiplexer, TargetConnSnapshot},
        listener::{RelayStreams, ServerRelayListener, ServerRelayListenerOptions},
        multiplexer::ClientMultiplexer,
        protocol::ConnectionId,
        transport::RelayTransport,
    },
};

struct ClientBridge {
    rule: ClientRule,
    local_addr: SocketAddr,
    mux: Arc<ClientMultiplexer>,
    server: ClientTcpServer,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientRuleSnapshot {
    pub relay_channel: String,
    pub local_addr: SocketAddr,
    pub remote_port: u16,
    pub relay_connected: bool,
    pub connections: Vec<ConnectionId>,
}

pub struct ClientHost {
    bridges: Vec<ClientBridge>,
}

impl ClientHost {
    /// Starts every rule: multiplexer first, then the local listener. A bind failure stops
    /// the rules already started and fails the whole host.
    pub async fn start(
        rules: &[ClientRule],
        transport: Arc<dyn RelayTransport>,
    ) -> anyhow::Result<Self> {
        let mut host = Self {
            bridges: Vec::with_capacity(rules.len()),
        };

        for rule in rules {
            let sockets = Arc::new(LocalSockets::new());
            let mux = Arc::new(ClientMultiplexer::new(
                rule.relay_channel.clone(),
                transport.clone(),
                sockets.clone(),
            ));
            mux.start().await;

            let server = ClientTcpServer::new(
                ClientTcpServerOptions {
                    listen_addr: rule.listen_addr(),
                    remote_port: rule.remote_port,
                    relay_channel: rule.relay_channel.clone(),
                },
                mux.clone(),
                sockets,
            );
            let local_addr = match server.start().await {
                Ok(a) => a,
                Err(err) => {
                    mux.stop().await;
                    host.stop().await;
                    return Err(err);
                }
            };

            host.bridges.push(ClientBridge {
                rule: rule.clone(),
                local_addr,
                mux,
                server,
            });
        }

        tracing::info!(rules = host.bridges.len(), "client: bridge started");
        Ok(host)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bridges.iter().map(|b| b.local_addr).collect()
    }

    pub async fn snapshot(&self) -> Vec<ClientRuleSnapshot> {
        let mut out = Vec::with_capacity(self.bridges.len());
        for b in &self.bridges {
            out.push(ClientRuleSnapshot {
                relay_channel: b.rule.relay_channel.clone(),
                local_addr: b.local_addr,
                remote_port: b.rule.remote_port,
                relay_connected: b.mux.is_connected().await,
                connections: b.server.sockets().ids().await,
            });
        }
        out
    }

    pub async fn stop(&self) {
        for b in &self.bridges {
            b.server.stop().await;
            b.mux.stop().await;
        }
    }
}

struct ServerBridge {
    rule: ServerRule,
    instance: usize,
    listener: ServerRelayListener,
    demux: Arc<ServerDemultiplexer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerListenerSnapshot {
    pub relay_channel: String,
    pub instance: usize,
    pub target_hostname: String,
    pub relay_streams: usize,
    pub connections: Vec<TargetConnSnapshot>,
}

pub struct ServerHost {
    bridges: Vec<ServerBridge>,
}

impl ServerHost {
    /// Starts `instance_count` listeners per rule. Individual listen failures are logged;
    /// the host only fails when no listener could start at all.
    pub async fn start(
        rules: &[ServerRule],
        transport: Arc<dyn RelayTransport>,
    ) -> anyhow::Result<Self> {
        let mut bridges = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            for instance in 0..rule.instance_count.max(1) {
                let streams = Arc::new(RelayStreams::new());
                let demux = Arc::new(ServerDemultiplexer::new(
                    rule.target_hostname.clone(),
                    streams.clone(),
                ));
                let listener = ServerRelayListener::new(
                    ServerRelayListenerOptions {
                        relay_channel: rule.relay_channel.clone(),
                        allowed_ports: rule.allowed_target_ports.clone(),
                        instance,
                    },
                    transport.clone(),
                    demux.clone(),
                    streams,
                );
                if let Err(err) = listener.start().await {
                    tracing::error!(rule = i, instance, err = %err, "server: relay listener failed to start");
                    continue;
                }
                bridges.push(ServerBridge {
                    rule: rule.clone(),
                    instance,
                    listener,
                    demux,
                });
            }
        }

        if bridges.is_empty() && !rules.is_empty() {
            anyhow::bail!("server: no relay listener could be started");
        }
        tracing::info!(listeners = bridges.len(), "server: bridge started");
        Ok(Self { bridges })
    }

    pub async fn snapshot(&self) -> Vec<ServerListenerSnapshot> {
        let mut out = Vec::with_capacity(self.bridges.len());
        for b in &self.bridges {
            out.push(ServerListenerSnapshot {
                relay_channel: b.rule.relay_channel.clone(),
                instance: b.instance,
                target_hostname: b.rule.target_hostname.clone(),
                relay_streams: b.listener.streams().len().await,
                connections: b.demux.snapshot().await,
            });
        }
        out
    }

    pub async fn stop(&self) {
        for b in &self.bridges {
            b.listener.stop().await;
            b.demux.close_all().await;
        }
    }
}
