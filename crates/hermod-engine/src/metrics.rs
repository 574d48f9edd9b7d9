//! Process metrics + health endpoints (SPEC_FULL.md §4.10 AMBIENT:
//! `hermod_messages_read_total`, `hermod_messages_acked_total`,
//! `hermod_batch_size`, `hermod_sink_write_latency_seconds`,
//! `hermod_retry_total`), served over `axum` the way
//! `examples/Hartman25-MiniQuantDeskV4`'s `mqk-daemon` serves its
//! `/v1/health` route — a small `Router` built once and spawned alongside
//! the engine's other tasks.
//!
//! The teacher workspace declares `metrics`, `metrics-exporter-prometheus`
//! and `axum` as dependencies but never wires them; per SPEC_FULL.md's
//! ambient-stack rule, Hermod actually serves them rather than carrying
//! dead weight in `Cargo.toml`.

use std::net::SocketAddr;

use axum::routing::get;
use axum::{Router, http::StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install the global Prometheus recorder and spawn the `/metrics` +
/// `/healthz` HTTP server on `addr`. Returns immediately; the server task
/// is cancelled via `cancel`.
pub fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<(), anyhow::Error> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route("/metrics", get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }))
        .route("/healthz", get(|| async { (StatusCode::OK, "ok") }));

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, %addr, "failed to bind metrics server");
                return;
            }
        };
        info!(%addr, "metrics server listening");
        let serve = axum::serve(listener, app);
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = serve => {
                if let Err(e) = result {
                    warn!(error = %e, "metrics server exited");
                }
            }
        }
    });

    Ok(())
}

pub fn record_read() {
    metrics::counter!("hermod_messages_read_total").increment(1);
}

pub fn record_acked(n: u64) {
    metrics::counter!("hermod_messages_acked_total").increment(n);
}

pub fn record_batch_size(n: usize) {
    metrics::histogram!("hermod_batch_size").record(n as f64);
}

pub fn record_sink_latency(sink_id: &str, seconds: f64) {
    metrics::histogram!("hermod_sink_write_latency_seconds", "sink" => sink_id.to_string()).record(seconds);
}

pub fn record_retry() {
    metrics::counter!("hermod_retry_total").increment(1);
}
