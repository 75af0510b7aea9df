use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CONNECTIONS_TOTAL: &str = "portbridge_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "portbridge_active_connections";
pub const FRAMES_TOTAL: &str = "portbridge_frames_total";
pub const BYTES_TOTAL: &str = "portbridge_bytes_total";
pub const REJECTED_PORTS_TOTAL: &str = "portbridge_rejected_ports_total";
pub const RELAY_STREAMS_ACTIVE: &str = "portbridge_relay_streams_active";

/// Installs the process-wide recorder behind the tunnel counters. Only the admin endpoint
/// needs it; without it the `metrics` macros record nothing.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
