//! Relay HTTP host adapter
//!
//! Axum server that receives queue-trigger invocations from the Azure
//! Functions host (custom handler protocol) and runs the relay pipeline once
//! per invocation. A non-2xx reply marks the invocation failed, which hands
//! redelivery and poison-queue decisions back to the host.
//!
//! Each endpoint is a thin axum handler over a directly testable inner
//! function.
//!
//! Endpoints:
//! - POST /{function_name}: custom-handler invocation (default `/QueueMessage`)
//! - POST /messages: raw compressed message as the request body
//! - GET  /health: store backend status
//! - GET  /version: server version info

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use relay_core::RelayConfig;
use relay_ingest::{process_message, FanOutWriter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Port assigned by the functions host to a custom handler.
pub const HANDLER_PORT_ENV: &str = "FUNCTIONS_CUSTOMHANDLER_PORT";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub writer: FanOutWriter,
    pub config: RelayConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let invoke_path = format!("/{}", state.config.service.function_name);
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/messages", post(messages_handler))
        .route(&invoke_path, post(invoke_handler))
        .with_state(state)
}

/// The host-assigned port wins over the configured one.
pub fn listen_addr(config: &RelayConfig, handler_port: Option<String>) -> String {
    let port = handler_port
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or(config.http.port);
    format!("{}:{}", config.http.host, port)
}

/// Start the HTTP server. Stops accepting invocations when the broadcast
/// shutdown signal fires; the host kills the process if draining overruns.
pub async fn start_http_server(
    writer: FanOutWriter,
    config: RelayConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    // A colliding invocation route would panic inside the router.
    config.service.validate()?;

    let addr = listen_addr(&config, std::env::var(HANDLER_PORT_ENV).ok());
    let state = Arc::new(HttpState { writer, config });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Relay HTTP host listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

/// Invocation body posted by the functions host.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationRequest {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Invocation result returned to the functions host.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationResponse {
    pub outputs: Map<String, Value>,
    pub logs: Vec<String>,
    pub return_value: Value,
}

impl InvocationResponse {
    fn with_logs(logs: Vec<String>) -> Self {
        Self {
            outputs: Map::new(),
            logs,
            return_value: Value::Null,
        }
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Extract the compressed payload from the invocation's trigger binding.
/// The host delivers binary queue messages as base64 text, sometimes
/// JSON-quoted a second time.
pub fn decode_binding(data: &Map<String, Value>, binding: &str) -> Result<Vec<u8>, String> {
    let raw = match data.get(binding) {
        Some(Value::String(s)) => s.trim(),
        Some(other) => {
            return Err(format!(
                "binding '{}' must be a base64 string, found {}",
                binding, other
            ))
        }
        None => return Err(format!("invocation has no '{}' binding", binding)),
    };

    let unquoted = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        serde_json::from_str::<String>(raw).map_err(|e| format!("bad quoted binding: {}", e))?
    } else {
        raw.to_string()
    };

    STANDARD
        .decode(unquoted.trim())
        .map_err(|e| format!("binding '{}' is not valid base64: {}", binding, e))
}

/// Inner invocation: decode the trigger binding and relay the message.
pub async fn invoke_inner(
    writer: &FanOutWriter,
    binding: &str,
    req: InvocationRequest,
) -> (StatusCode, InvocationResponse) {
    let queue_message_id = req
        .metadata
        .get("Id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let dequeue_count = req
        .metadata
        .get("DequeueCount")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0);

    let payload = match decode_binding(&req.data, binding) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                queue_message_id = %queue_message_id,
                error = %e,
                "Invocation carried no usable payload"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                InvocationResponse::with_logs(vec![e]),
            );
        }
    };

    let start = Instant::now();
    match process_message(&payload, writer).await {
        Ok(receipt) => {
            let took_ms = start.elapsed().as_millis() as u64;
            tracing::info!(
                queue_message_id = %queue_message_id,
                dequeue_count = dequeue_count,
                message_id = %receipt.message_id,
                took_ms = took_ms,
                "Queue message relayed"
            );
            (
                StatusCode::OK,
                InvocationResponse::with_logs(vec![format!(
                    "relayed queue message {} as message_id {}",
                    queue_message_id, receipt.message_id
                )]),
            )
        }
        Err(e) => {
            tracing::error!(
                queue_message_id = %queue_message_id,
                dequeue_count = dequeue_count,
                kind = e.kind(),
                store_status = ?e.store_status(),
                error = %e,
                "Queue message failed"
            );
            let mut logs = vec![e.to_string()];
            if let Some(code) = e.store_status() {
                logs.push(format!("store responded with status {}", code));
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                InvocationResponse::with_logs(logs),
            )
        }
    }
}

/// Inner raw-bytes relay.
pub async fn messages_inner(writer: &FanOutWriter, body: &[u8]) -> (StatusCode, Value) {
    match process_message(body, writer).await {
        Ok(receipt) => (
            StatusCode::OK,
            serde_json::json!({
                "message_id": receipt.message_id,
                "document_ids": receipt.document_ids,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": e.to_string(),
                "kind": e.kind(),
                "store_status": e.store_status(),
                "status": "error",
            }),
        ),
    }
}

/// Inner health check: probes the store and returns (status_code, json_body).
pub async fn health_inner(writer: &FanOutWriter) -> (StatusCode, Value) {
    let store = writer.store();
    match store.health().await {
        Ok(detail) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store.name(),
                "detail": detail,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "store": store.name(),
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "relay/1",
    })
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn invoke_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<InvocationRequest>,
) -> impl IntoResponse {
    let (status, body) = invoke_inner(&state.writer, &state.config.service.binding, req).await;
    (status, Json(body))
}

pub async fn messages_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> impl IntoResponse {
    let (status, body) = messages_inner(&state.writer, &body).await;
    (status, Json(body))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.writer).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{ContainersConfig, DocumentStore, MemoryDocumentStore, StoreError};
    use serde_json::json;

    fn make_writer() -> (MemoryDocumentStore, FanOutWriter) {
        let store = MemoryDocumentStore::new();
        let writer = FanOutWriter::new(Arc::new(store.clone()), ContainersConfig::default());
        (store, writer)
    }

    fn valid_payload() -> Vec<u8> {
        relay_ingest::compress(
            r#"{"input_json":{"a":1},"output_json":{"b":2},"api_output":{"id":"orig-123","c":3}}"#,
        )
        .unwrap()
    }

    fn invocation(message: Value) -> InvocationRequest {
        InvocationRequest {
            data: json!({ "message": message }).as_object().unwrap().clone(),
            metadata: json!({"Id": "q-1", "DequeueCount": "2"})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "relay/1");
    }

    #[test]
    fn test_decode_binding_plain_and_quoted() {
        let bytes = vec![0x1f, 0x8b, 0x08, 0x00];
        let encoded = STANDARD.encode(&bytes);

        let data = json!({ "message": encoded.clone() });
        assert_eq!(decode_binding(data.as_object().unwrap(), "message").unwrap(), bytes);

        let quoted = json!({ "message": format!("\"{}\"", encoded) });
        assert_eq!(decode_binding(quoted.as_object().unwrap(), "message").unwrap(), bytes);
    }

    #[test]
    fn test_decode_binding_errors() {
        let missing = json!({});
        let err = decode_binding(missing.as_object().unwrap(), "message").unwrap_err();
        assert!(err.contains("no 'message' binding"));

        let wrong_type = json!({ "message": 12 });
        assert!(decode_binding(wrong_type.as_object().unwrap(), "message").is_err());

        let not_base64 = json!({ "message": "!!not base64!!" });
        assert!(decode_binding(not_base64.as_object().unwrap(), "message").is_err());
    }

    #[test]
    fn test_listen_addr_prefers_handler_port() {
        let config = RelayConfig::default();
        assert_eq!(listen_addr(&config, None), "127.0.0.1:7071");
        assert_eq!(listen_addr(&config, Some("8080".to_string())), "127.0.0.1:8080");
        assert_eq!(listen_addr(&config, Some("junk".to_string())), "127.0.0.1:7071");
    }

    #[tokio::test]
    async fn test_invoke_inner_relays_message() {
        let (store, writer) = make_writer();
        let req = invocation(json!(STANDARD.encode(valid_payload())));

        let (status, body) = invoke_inner(&writer, "message", req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.return_value, Value::Null);
        assert!(body.logs[0].contains("q-1"));
        assert_eq!(store.count().await, 3);
    }

    #[tokio::test]
    async fn test_invoke_inner_fails_invocation_on_bad_payload() {
        let (store, writer) = make_writer();
        let req = invocation(json!(STANDARD.encode(b"not gzip")));

        let (status, body) = invoke_inner(&writer, "message", req).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.logs[0].starts_with("Decompression error"));
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_invoke_inner_fails_invocation_without_binding() {
        let (store, writer) = make_writer();

        let (status, body) = invoke_inner(&writer, "message", InvocationRequest::default()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.logs.len(), 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_messages_inner_reports_partial_write() {
        let (store, writer) = make_writer();
        store.fail_container("js_input").await;

        let (status, body) = messages_inner(&writer, &valid_payload()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "persistence");
        assert!(body["store_status"].is_null());
        assert_eq!(store.count().await, 1);
    }

    /// Store that rejects every insert the way a throttled Cosmos account does.
    struct ThrottledStore;

    #[async_trait::async_trait]
    impl DocumentStore for ThrottledStore {
        async fn insert(&self, _container: &str, _document: &Value) -> Result<(), StoreError> {
            Err(StoreError::Api {
                code: 429,
                message: "Request rate is large".to_string(),
            })
        }

        async fn query_all(&self, _container: &str) -> Result<Vec<Value>, StoreError> {
            Ok(Vec::new())
        }

        async fn health(&self) -> Result<String, StoreError> {
            Ok("throttled".to_string())
        }

        fn name(&self) -> &str {
            "throttled"
        }
    }

    #[tokio::test]
    async fn test_store_status_reaches_host_responses() {
        let writer = FanOutWriter::new(Arc::new(ThrottledStore), ContainersConfig::default());

        let (status, body) = messages_inner(&writer, &valid_payload()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["store_status"], 429);

        let req = invocation(json!(STANDARD.encode(valid_payload())));
        let (status, body) = invoke_inner(&writer, "message", req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.logs.len(), 2);
        assert_eq!(body.logs[1], "store responded with status 429");
    }

    #[tokio::test]
    async fn test_health_inner_reports_backend() {
        let (_store, writer) = make_writer();
        let (status, body) = health_inner(&writer).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
