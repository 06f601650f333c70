use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup. Without it the `metrics` macros are no-ops.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Counts a live peer connection for as long as it is held.
#[derive(Debug)]
pub struct ActivePeerGuard {
    role: &'static str,
}

impl ActivePeerGuard {
    pub fn new(role: &'static str) -> Self {
        metrics::counter!("tether_peers_opened_total", "role" => role).increment(1);
        metrics::gauge!("tether_peers_active", "role" => role).increment(1.0);
        Self { role }
    }
}

impl Drop for ActivePeerGuard {
    fn drop(&mut self) {
        metrics::gauge!("tether_peers_active", "role" => self.role).decrement(1.0);
    }
}

pub fn record_dropped(reason: &'static str) {
    metrics::counter!("tether_dropped_envelopes_total", "reason" => reason).increment(1);
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
