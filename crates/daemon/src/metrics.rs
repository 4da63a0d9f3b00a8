//! Prometheus metrics export.
//!
//! The daemons have no HTTP surface, so metrics are written in the text
//! exposition format to a file picked up by node_exporter's textfile
//! collector.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registry holding every core metric.
pub fn registry() -> Result<Registry> {
    let registry = Registry::new();
    for metric in pulsarflow_core::metrics::all_metrics() {
        registry
            .register(metric)
            .context("Failed to register metric")?;
    }
    Ok(registry)
}

/// Write the current values to `path`, replacing it atomically.
pub fn write_metrics(registry: &Registry, path: &Path) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;

    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, &buffer)
        .with_context(|| format!("Failed to write metrics to {:?}", tmp))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move metrics into {:?}", path))?;
    debug!("Wrote metrics to {:?}", path);
    Ok(())
}

/// Rewrite the metrics file every `interval`.
pub fn spawn_exporter(registry: Registry, path: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = write_metrics(&registry, &path) {
                warn!("{:#}", e);
            }
        }
    })
}
