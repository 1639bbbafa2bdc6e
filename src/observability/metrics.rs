//! Prometheus metrics.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

/// Default exporter port.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether a recorder is installed at all.
    pub enabled: bool,
    /// Serve `/metrics` over HTTP on `listen_addr`.
    pub expose: bool,
    /// Address to bind the exporter.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expose: false,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_METRICS_PORT),
        }
    }
}

impl MetricsConfig {
    /// Builds metrics configuration from `SWARMKERNEL_METRICS_ENABLED`,
    /// `SWARMKERNEL_METRICS_EXPOSE`, and `SWARMKERNEL_METRICS_PORT`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = parse_bool_env("SWARMKERNEL_METRICS_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(expose) = parse_bool_env("SWARMKERNEL_METRICS_EXPOSE") {
            config.expose = expose;
        }
        if let Some(port) = parse_port_env("SWARMKERNEL_METRICS_PORT") {
            config.listen_addr.set_port(port);
        }
        config
    }
}

/// Installs the global Prometheus recorder.
///
/// Returns `None` when metrics are disabled. With `expose` set, an HTTP
/// listener serves the scrape endpoint; it runs on the ambient tokio runtime
/// or on a dedicated exporter thread when called outside one.
///
/// # Errors
///
/// Returns [`Error::Validation`] if a global recorder is already installed,
/// and [`Error::Storage`] if the exporter cannot be built.
pub fn install_metrics(config: &MetricsConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let handle = if config.expose {
        install_listener(builder.with_http_listener(config.listen_addr))?
    } else {
        let recorder = builder.build_recorder();
        let handle = recorder.handle();
        set_global_recorder(recorder)?;
        handle
    };
    tracing::info!(expose = config.expose, addr = %config.listen_addr, "Metrics recorder installed");
    Ok(Some(handle))
}

fn install_listener(builder: PrometheusBuilder) -> Result<PrometheusHandle> {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return install_with_runtime(builder, &handle);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::storage("metrics_runtime_init"))?;
    let handle = runtime.handle().clone();
    let prometheus = install_with_runtime(builder, &handle)?;
    thread::Builder::new()
        .name("swarmkernel-metrics-http".to_string())
        .spawn(move || runtime.block_on(std::future::pending::<()>()))
        .map_err(Error::storage("metrics_runtime_thread"))?;
    Ok(prometheus)
}

fn install_with_runtime(
    builder: PrometheusBuilder,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<PrometheusHandle> {
    let (recorder, exporter) = {
        let _guard = runtime_handle.enter();
        builder
            .build()
            .map_err(Error::storage("metrics_exporter_build"))?
    };
    let handle = recorder.handle();
    set_global_recorder(recorder)?;
    runtime_handle.spawn(exporter);
    Ok(handle)
}

fn set_global_recorder(recorder: PrometheusRecorder) -> Result<()> {
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::Validation(format!("metrics recorder already installed: {e}")))
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.trim().to_lowercase();
        value == "true" || value == "1" || value == "yes"
    })
}

fn parse_port_env(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_installs_nothing() {
        let handle = install_metrics(&MetricsConfig::default()).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_recorder_renders_kernel_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("pattern_stored_total").increment(2);
        });
        assert!(handle.render().contains("pattern_stored_total 2"));
    }
}
