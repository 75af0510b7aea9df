use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::portbridge::{
    admin, config, logging, net, telemetry,
    tunnel::{
        host::{ClientHost, ServerHost},
        rendezvous, transport,
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let client_rules = cfg.client.as_ref().map(|c| c.rules.as_slice()).unwrap_or(&[]);
    let server_rules = cfg.server.as_ref().map(|s| s.rules.as_slice()).unwrap_or(&[]);
    let client_enabled = !client_rules.is_empty();
    let server_enabled = !server_rules.is_empty();
    let rendezvous_enabled = cfg.rendezvous.is_some();
    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    if !client_enabled && !server_enabled && !rendezvous_enabled {
        anyhow::bail!(
            "config: nothing to run (set client.rules and/or server.rules and/or rendezvous)"
        );
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        client_enabled,
        server_enabled,
        rendezvous_enabled,
        admin_addr = %cfg.admin_addr,
        client_rules = client_rules.len(),
        server_rules = server_rules.len(),
        "portbridge: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // The hub comes first so same-process bridges can reach it immediately.
    if let Some(rv) = cfg.rendezvous.clone() {
        let ln = rendezvous::bind(&rv.listen_addr).await?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { rendezvous::serve_listener(ln, &rv.keys, shutdown).await });
    }

    let mut server_host = None;
    let mut client_host = None;
    if client_enabled || server_enabled {
        let relay = transport::transport_from_config(&cfg.relay)?;

        // Server before client, so the client's first relay stream finds a listener.
        if server_enabled {
            server_host = Some(Arc::new(ServerHost::start(server_rules, relay.clone()).await?));
        }
        if client_enabled {
            match ClientHost::start(client_rules, relay).await {
                Ok(h) => client_host = Some(Arc::new(h)),
                Err(err) => {
                    if let Some(s) = &server_host {
                        s.stop().await;
                    }
                    return Err(err);
                }
            }
        }
    }

    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let state = admin::AdminState {
            prom: Arc::new(telemetry::init_prometheus()?),
            client: client_host.clone(),
            server: server_host.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        Some(res) = tasks.join_next(), if !tasks.is_empty() => {
            match res {
                Ok(Ok(())) => tracing::warn!("shutdown: background task ended"),
                Ok(Err(err)) => failure = Some(err),
                Err(join_err) => failure = Some(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        if let Some(c) = &client_host {
            c.stop().await;
        }
        if let Some(s) = &server_host {
            s.stop().await;
        }
        while let Some(_res) = tasks.join_next().await {
            // Best-effort: errors during teardown are not interesting.
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match failure {
        Some(err) => Err(err),
        None => {
            tracing::info!("portbridge: stopped");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
