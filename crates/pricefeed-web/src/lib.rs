//! Axum HTTP surface for invocation envelopes.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pricefeed_ingest::{handle_value, BatchCoordinator};
use pricefeed_storage::StoreError;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pricefeed-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BatchCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<BatchCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(invoke_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn invoke_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<JsonValue>,
) -> Response {
    match handle_value(&state.coordinator, event).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => store_error(err),
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.store().probe().await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, retryable = err.is_retryable(), "store call failed");
    let status = if err.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use pricefeed_ingest::{Normalizer, TracingMetrics};
    use pricefeed_queue::LogOnlyDeadLetterSink;
    use pricefeed_storage::MemoryPriceStore;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<MemoryPriceStore>) {
        let store = Arc::new(MemoryPriceStore::new());
        let coordinator = BatchCoordinator::new(
            Normalizer::default(),
            store.clone(),
            Arc::new(LogOnlyDeadLetterSink),
            Arc::new(TracingMetrics::new()),
        );
        (app(AppState::new(Arc::new(coordinator))), store)
    }

    fn invoke(body: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/invoke")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reflects_store_availability() {
        let (app, store) = test_app();
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        store.set_unavailable(true);
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn invoke_processes_batches_with_partial_failures() {
        let (app, store) = test_app();
        let good = serde_json::json!({
            "provider": "yohananof", "branch": "7", "type": "pricesFull",
            "timestamp": "2024-01-05T10:00:00Z",
            "items": [{"product": "milk", "unit": "l", "price": 6.1}]
        })
        .to_string();
        let resp = app
            .oneshot(invoke(serde_json::json!({"Records": [
                {"messageId": "1", "body": good},
                {"messageId": "2", "body": "{\"items\": []}"}
            ]})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_body(resp).await,
            serde_json::json!({"batchItemFailures": [{"itemIdentifier": "2"}]})
        );
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn invoke_admin_actions() {
        let (app, store) = test_app();
        let resp = app
            .clone()
            .oneshot(invoke(serde_json::json!({"action": "setup"})))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, serde_json::json!({"ok": true, "setup": "done"}));
        assert!(store.schema_ready().await);

        let resp = app
            .clone()
            .oneshot(invoke(serde_json::json!({"action": "count"})))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, serde_json::json!({"count": 0}));

        let resp = app
            .oneshot(invoke(serde_json::json!({"action": "vacuum"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_body(resp).await,
            serde_json::json!({"error": "Unexpected event shape"})
        );
    }
}
