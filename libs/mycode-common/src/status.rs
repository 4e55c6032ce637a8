// Status endpoints served next to a consumer service

use crate::consumer::{ConsumerSnapshot, ConsumerStats};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct StatusState {
    pub started_at: DateTime<Utc>,
    pub consumers: Vec<Arc<ConsumerStats>>,
}

impl StatusState {
    pub fn new(consumers: Vec<Arc<ConsumerStats>>) -> Self {
        Self {
            started_at: Utc::now(),
            consumers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub started_at: DateTime<Utc>,
    pub consumers: Vec<ConsumerSnapshot>,
}

/// GET /status - Liveness
pub async fn status() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /stats - Consumer counters
pub async fn stats(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let body = StatsResponse {
        started_at: state.started_at,
        consumers: state.consumers.iter().map(|c| c.snapshot()).collect(),
    };
    (StatusCode::OK, Json(body))
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/stats", get(stats))
        .with_state(Arc::new(state))
}

pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on {}", addr);
    Ok(listener)
}

/// Serves the status router until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: StatusState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_status_is_ok() {
        let app = router(StatusState::new(Vec::new()));
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_stats_reports_consumers() {
        let stats = Arc::new(ConsumerStats::new("code", 30));
        let app = router(StatusState::new(vec![stats]));
        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["consumers"][0]["queue"], "code");
        assert_eq!(json["consumers"][0]["prefetch"], 30);
        assert_eq!(json["consumers"][0]["in_flight"], 0);
        assert!(json["started_at"].is_string());
    }
}
