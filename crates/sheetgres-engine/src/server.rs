//! Metrics and status listener.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::Metrics;

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
}

async fn status_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    Json(metrics.status())
}

/// Serve `/metrics` and `/status` until the shutdown signal fires.
pub async fn serve(metrics: Arc<Metrics>, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics listener");
            return;
        }
    };

    info!(addr = %addr, "Metrics listener started");

    let result = axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;

    if let Err(e) = result {
        error!(error = %e, "Metrics listener error");
    }
}
