use crate::config::ApiConfig;
use crate::document_store::{DocumentStore, StoreError};
use crate::models::{clamp_limit, Collection, Record};
use crate::mqtt_bridge::{BridgeError, IngestionBridge};
use crate::upload::{read_upload, store_upload, UploadError};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub bridge: Arc<IngestionBridge>,
    pub upload_dir: PathBuf,
}

/// Query parameters for the recent-records endpoints
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

/// Publish request body
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: Option<String>,
    pub message: Option<String>,
}

/// Body returned by write endpoints on success
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Publish failure body
#[derive(Debug, Serialize)]
pub struct PublishFailure {
    pub success: bool,
    pub error: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors surfaced by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Failed to publish message: {0}")]
    Publish(#[source] BridgeError),

    #[error("Failed to fetch {collection}: {source}")]
    FetchFailed {
        collection: Collection,
        #[source]
        source: StoreError,
    },

    #[error("Failed to process image upload: {0}")]
    Upload(#[source] UploadError),
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::InvalidRequest(message) => ApiError::InvalidRequest(message),
            other => ApiError::Publish(other),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::MissingImage => {
                ApiError::InvalidRequest(UploadError::MissingImage.to_string())
            }
            UploadError::Multipart(ref m) => {
                ApiError::InvalidRequest(format!("Malformed upload: {}", m.body_text()))
            }
            other => ApiError::Upload(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidRequest(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
            }
            ApiError::Publish(e) => {
                error!(error = %e, "Error publishing MQTT message");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(PublishFailure {
                        success: false,
                        error: "Failed to publish message".to_string(),
                    }),
                )
                    .into_response()
            }
            ApiError::FetchFailed { collection, source } => {
                error!(error = %source, collection = %collection, "Error fetching records");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: format!("Failed to fetch {}", collection),
                    }),
                )
                    .into_response()
            }
            ApiError::Upload(e) => {
                error!(error = %e, "Error handling image upload");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Failed to process image upload".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/getMessages", get(get_messages))
        .route("/api/getDetections", get(get_detections))
        .route("/api/mqttHandler", post(publish_message))
        .route("/api/uploadImage", post(upload_image))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "iot-monitor"
    }))
}

/// Readiness: storage must answer; bridge state is reported but not required
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let bridge = state.bridge.state();

    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "mqtt": bridge,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "mqtt": bridge,
                "error": e.to_string()
            })),
        ),
    }
}

async fn find_recent(
    state: &AppState,
    collection: Collection,
    query: RecentQuery,
) -> Result<Json<Vec<Record>>, ApiError> {
    let records = state
        .store
        .find_recent(collection, clamp_limit(query.limit))
        .await
        .map_err(|source| ApiError::FetchFailed { collection, source })?;

    Ok(Json(records))
}

/// Latest messages, newest first
#[instrument(skip(state))]
async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    find_recent(&state, Collection::Messages, query).await
}

/// Latest detections, newest first
#[instrument(skip(state))]
async fn get_detections(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    find_recent(&state, Collection::Detections, query).await
}

/// Publish a message to the broker
#[instrument(skip(state, body))]
async fn publish_message(
    State(state): State<AppState>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Rejected publish request body");
        ApiError::InvalidRequest("Topic and message are required".to_string())
    })?;

    let topic = request.topic.unwrap_or_default();
    let message = request.message.unwrap_or_default();

    state.bridge.publish(&topic, &message).await?;

    info!(topic = %topic, "Message published");
    Ok(Json(SuccessResponse { success: true }))
}

/// Accept an image upload and record it as a detection
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<SuccessResponse>, ApiError> {
    let upload = read_upload(multipart, &state.upload_dir).await?;
    let id = store_upload(state.store.as_ref(), upload).await?;

    info!(detection_id = %id, "Detection stored");
    Ok(Json(SuccessResponse { success: true }))
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerClient;
    use crate::document_store::MockDocumentStore;
    use crate::models::{Coordinates, Detection, Message, NewDetection};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use chrono::{Duration, Utc};
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "X-MONITOR-BOUNDARY";

    fn router(store: MockDocumentStore, broker: MockBrokerClient) -> Router {
        let store: Arc<dyn DocumentStore> = Arc::new(store);
        let bridge = Arc::new(IngestionBridge::new(
            Arc::new(broker),
            store.clone(),
            "test/topic",
            0,
        ));
        let state = AppState {
            store,
            bridge,
            upload_dir: std::env::temp_dir(),
        };
        create_router(state, &ApiConfig::default())
    }

    async fn connected_router(store: MockDocumentStore, mut broker: MockBrokerClient) -> Router {
        broker.expect_subscribe().returning(|_| Ok(()));
        let store: Arc<dyn DocumentStore> = Arc::new(store);
        let bridge = Arc::new(IngestionBridge::new(
            Arc::new(broker),
            store.clone(),
            "test/topic",
            0,
        ));
        bridge.on_connected().await.unwrap();
        let state = AppState {
            store,
            bridge,
            upload_dir: std::env::temp_dir(),
        };
        create_router(state, &ApiConfig::default())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/jpeg\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/api/uploadImage")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = router(MockDocumentStore::new(), MockBrokerClient::new());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_reports_storage_down() {
        let mut store = MockDocumentStore::new();
        store
            .expect_ping()
            .returning(|| Err(StoreError::Unavailable("down".to_string())));

        let app = router(store, MockBrokerClient::new());
        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["mqtt"], "disconnected");
    }

    #[tokio::test]
    async fn test_get_messages_returns_newest_first() {
        let now = Utc::now();
        let mut store = MockDocumentStore::new();
        store
            .expect_find_recent()
            .withf(|collection, limit| *collection == Collection::Messages && *limit == 50)
            .times(1)
            .returning(move |_, _| {
                Ok(vec![
                    Record::Message(Message {
                        id: Uuid::new_v4(),
                        topic: "test/topic".to_string(),
                        payload: "newer".to_string(),
                        timestamp: now,
                    }),
                    Record::Message(Message {
                        id: Uuid::new_v4(),
                        topic: "test/topic".to_string(),
                        payload: "older".to_string(),
                        timestamp: now - Duration::seconds(5),
                    }),
                ])
            });

        let app = router(store, MockBrokerClient::new());
        let response = app
            .oneshot(Request::get("/api/getMessages").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["message"], "newer");
        assert_eq!(body[1]["message"], "older");
    }

    #[tokio::test]
    async fn test_get_detections_caps_limit() {
        let mut store = MockDocumentStore::new();
        store
            .expect_find_recent()
            .withf(|collection, limit| *collection == Collection::Detections && *limit == 50)
            .times(1)
            .returning(|_, _| {
                Ok(vec![Record::Detection(Detection {
                    id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    image: "aW1n".to_string(),
                    location: "MainSt".to_string(),
                    coordinates: Some(Coordinates {
                        latitude: 13.75,
                        longitude: 100.5,
                    }),
                    confidence: 0.92,
                })])
            });

        let app = router(store, MockBrokerClient::new());
        let response = app
            .oneshot(
                Request::get("/api/getDetections?limit=500")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["coordinates"]["latitude"], 13.75);
    }

    #[tokio::test]
    async fn test_get_messages_storage_failure_is_500() {
        let mut store = MockDocumentStore::new();
        store
            .expect_find_recent()
            .returning(|_, _| Err(StoreError::Unavailable("down".to_string())));

        let app = router(store, MockBrokerClient::new());
        let response = app
            .oneshot(Request::get("/api/getMessages").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Failed to fetch messages");
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let app = router(MockDocumentStore::new(), MockBrokerClient::new());
        let response = app
            .oneshot(Request::get("/api/mqttHandler").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_publish_missing_message_is_400() {
        let mut broker = MockBrokerClient::new();
        broker.expect_publish().times(0);

        let app = connected_router(MockDocumentStore::new(), broker).await;
        let response = app
            .oneshot(json_request(
                "/api/mqttHandler",
                serde_json::json!({ "topic": "test/topic" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Topic and message are required");
    }

    #[tokio::test]
    async fn test_publish_oversized_message_is_400() {
        let mut broker = MockBrokerClient::new();
        broker.expect_publish().times(0);

        let app = connected_router(MockDocumentStore::new(), broker).await;
        let message = "x".repeat(2 * 1024 * 1024);
        let response = app
            .oneshot(json_request(
                "/api/mqttHandler",
                serde_json::json!({ "topic": "test/topic", "message": message }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_success() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_publish()
            .withf(|topic: &str, payload: &Vec<u8>| topic == "test/topic" && payload == b"hello")
            .times(1)
            .returning(|_, _| Ok(()));

        let app = connected_router(MockDocumentStore::new(), broker).await;
        let response = app
            .oneshot(json_request(
                "/api/mqttHandler",
                serde_json::json!({ "topic": "test/topic", "message": "hello" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_publish_failure_is_structured() {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_publish()
            .returning(|_, _| Err(BridgeError::BrokerUnavailable("closed".to_string())));

        let app = connected_router(MockDocumentStore::new(), broker).await;
        let response = app
            .oneshot(json_request(
                "/api/mqttHandler",
                serde_json::json!({ "topic": "test/topic", "message": "hello" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Failed to publish message");
    }

    #[tokio::test]
    async fn test_upload_stores_detection() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert_detection()
            .withf(|d: &NewDetection| {
                d.location == "MainSt"
                    && d.coordinates
                        == Some(Coordinates {
                            latitude: 13.75,
                            longitude: 100.50,
                        })
                    && d.confidence == 0.92
                    && d.image == "SGVsbG8="
            })
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));

        let app = router(store, MockBrokerClient::new());
        let request = multipart_request(&[
            ("location", None, "MainSt"),
            ("latitude", None, "13.75"),
            ("longitude", None, "100.50"),
            ("confidence", None, "0.92"),
            ("image", Some("vendor.jpg"), "Hello"),
        ]);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_upload_without_image_is_400() {
        let mut store = MockDocumentStore::new();
        store.expect_insert_detection().times(0);

        let app = router(store, MockBrokerClient::new());
        let request = multipart_request(&[("location", None, "MainSt")]);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "No image file provided");
    }
}
