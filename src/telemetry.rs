//! Logging and metrics setup.
use std::net::SocketAddr;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install the fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Install the Prometheus recorder with its HTTP listener. Call once, inside the runtime.
pub fn install_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid metrics address '{addr}': {e}")))?;
    if addr.ip().is_unspecified() {
        tracing::warn!(listen_addr = %addr, "metrics endpoint is exposed on all interfaces");
    }
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Config(format!("failed to install metrics exporter: {e}")))?;
    describe_metrics();
    tracing::info!(listen_addr = %addr, "prometheus metrics listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("tag.detected", "Tags detected in the field");
    describe_counter!("tag.read.ok", "Tags dumped with at least one sector");
    describe_counter!("tag.read.err", "Failed tag read attempts");
    describe_counter!("tag.sector.skipped", "Sectors no key opened");
    describe_counter!("spoolman.post.ok", "Records accepted by SpoolMan");
    describe_counter!("spoolman.post.err", "Failed SpoolMan posts");
    describe_histogram!("tag.read.latency_ms", Unit::Milliseconds, "Time to dump one tag");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_metrics_address() {
        assert!(matches!(install_metrics("localhost"), Err(Error::Config(_))));
    }
}
