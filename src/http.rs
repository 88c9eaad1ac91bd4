use crate::status::StatusStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub store: Arc<StatusStore>,
}

pub fn build_router(store: Arc<StatusStore>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status_handler))
        .with_state(HttpAppState { store })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.store.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{GpuMetric, HostStatus, StatusMap};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let store = Arc::new(StatusStore::new());
        let app = build_router(store);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn api_status_returns_published_map_as_json() {
        let store = Arc::new(StatusStore::new());
        store
            .publish(StatusMap::from([(
                "gpu-1".to_string(),
                HostStatus {
                    cpu_usage_percentage: 12.5,
                    memory_used_mb: 400,
                    memory_total_mb: 1000,
                    memory_usage_percentage: 40.0,
                    gpus: vec![GpuMetric {
                        name: "NVIDIA GeForce RTX 3090".to_string(),
                        memory_used_mb: 6144,
                        memory_total_mb: 24576,
                        usage_percentage: 25.0,
                    }],
                },
            )]))
            .await;
        let app = build_router(store);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["gpu-1"]["cpu_usage_percentage"], 12.5);
        assert_eq!(json["gpu-1"]["memory_usage_percentage"], 40.0);
        assert_eq!(
            json["gpu-1"]["gpus"][0]["name"],
            "NVIDIA GeForce RTX 3090"
        );
    }

    #[tokio::test]
    async fn api_status_is_empty_object_before_first_cycle() {
        let store = Arc::new(StatusStore::new());
        let app = build_router(store);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
