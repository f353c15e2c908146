use std::io;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;

use crate::metrics::{global_metrics, global_spiller_stats};

/// Serve `/metrics` (Prometheus text) and `/spill/stats` (JSON snapshot of
/// the process-wide spiller stats) until the listener fails.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics_listener(listener).await
}

pub async fn serve_metrics_listener(listener: TcpListener) -> io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/spill/stats", get(spill_stats_handler));
    axum::serve(listener, app).await.map_err(io::Error::other)
}

async fn metrics_handler() -> String {
    global_metrics().render_prometheus()
}

async fn spill_stats_handler() -> String {
    let snapshot = global_spiller_stats().snapshot();
    serde_json::to_string(&snapshot).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{metrics_handler, spill_stats_handler};
    use crate::metrics::{global_metrics, global_spiller_stats};

    #[tokio::test]
    async fn metrics_handler_returns_prometheus_text() {
        global_metrics().record_spill("snappy", 64, 1, 0.001);
        let body = metrics_handler().await;
        assert!(body.contains("spillway_spill_bytes_total"));
        assert!(body.contains("snappy"));
    }

    #[tokio::test]
    async fn spill_stats_handler_returns_json_snapshot() {
        global_spiller_stats().add_spilled(128, 2, Duration::from_millis(1));
        let body = spill_stats_handler().await;
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert!(value["spilled_pages"].as_u64().expect("pages") >= 2);
        assert!(value["spilled_bytes"].as_u64().expect("bytes") >= 128);
    }
}
