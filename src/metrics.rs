use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

static EXPORTER: OnceCell<()> = OnceCell::new();

/// Install the Prometheus exporter. Safe to call more than once; only the
/// first call installs.
pub fn init_metrics() -> Result<()> {
    if EXPORTER.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    builder.install()?;
    let _ = EXPORTER.set(());
    Ok(())
}

/// Record a completed configuration reload.
pub fn record_reload() {
    metrics::counter!("fluxgate_config_reloads_total", 1);
}

/// Record the router count of the last published snapshot.
pub fn record_router_counts(http: usize, tcp: usize, udp: usize) {
    metrics::gauge!("fluxgate_http_routers", http as f64);
    metrics::gauge!("fluxgate_tcp_routers", tcp as f64);
    metrics::gauge!("fluxgate_udp_routers", udp as f64);
}
