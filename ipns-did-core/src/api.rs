//! REST API for DID resolution, publishing and node management

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{parse_codec, parse_hasher};
use crate::document::DidDocument;
use crate::identity::SigningIdentity;
use crate::method::IpnsDid;
use crate::publisher::{PublishError, PublishOptions};
use crate::resolver::ResolveError;
use crate::storage::BlockStore;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub method: Arc<IpnsDid>,
    /// Key that signs documents published through the API
    pub identity: Arc<Keypair>,
    pub options: PublishOptions,
    pub validity: Duration,
}

/// Body of POST /api/v1/publish
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub document: DidDocument,
    /// Codec name or hex tag; node default when absent
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub hasher: Option<String>,
    #[serde(default)]
    pub validity_secs: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub did: String,
    pub content_id: String,
    pub pointer_key_id: String,
    pub sequence: u64,
    pub key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDidResponse {
    pub did: String,
    pub peer_id: String,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub block_count: usize,
    pub did: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the REST API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        // DID resolution, in the shape universal resolvers expect
        .route("/1.0/identifiers/*did", get(resolve_identifier))
        .route("/api/v1/publish", post(publish_document))
        .route("/api/v1/did", get(node_did))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let block_count = state.method.content().blocks().block_count().await;

    Json(HealthResponse {
        status: "ok".to_string(),
        block_count,
        did: state.identity.did(),
    })
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<ApiState>) -> impl IntoResponse {
    let block_count = state.method.content().blocks().block_count().await;
    let metrics = state.method.metrics().to_prometheus(block_count);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
}

/// Resolve a DID (GET /1.0/identifiers/{did})
async fn resolve_identifier(
    State(state): State<ApiState>,
    Path(did): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    // The query string belongs to the DID URL, not to this endpoint
    let did_url = match query {
        Some(query) => format!("{}?{}", did, query),
        None => did,
    };
    info!("API: Resolving {}", did_url);

    let result = state.method.resolve(&did_url).await?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/did-resolution+json")],
        Json(result),
    )
        .into_response())
}

/// Publish a document under the node key (POST /api/v1/publish)
async fn publish_document(
    State(state): State<ApiState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let options = PublishOptions {
        codec: match &request.codec {
            Some(name) => parse_codec(name).map_err(|e| ApiError::BadRequest(e.to_string()))?,
            None => state.options.codec,
        },
        hasher: match &request.hasher {
            Some(name) => parse_hasher(name).map_err(|e| ApiError::BadRequest(e.to_string()))?,
            None => state.options.hasher,
        },
    };
    let validity = match request.validity_secs {
        Some(0) => return Err(ApiError::BadRequest("validitySecs must be positive".to_string())),
        Some(secs) => Duration::from_secs(secs),
        None => state.validity,
    };

    info!("API: Publishing document {}", request.document.id);
    let outcome = state
        .method
        .publish(&request.document, options, state.identity.as_ref(), validity)
        .await?;

    Ok(Json(PublishResponse {
        did: state.identity.did(),
        content_id: outcome.content_id.to_string(),
        pointer_key_id: outcome.pointer_key_id.to_string(),
        sequence: outcome.sequence,
        key: outcome.key,
    }))
}

/// DID of the node key (GET /api/v1/did)
async fn node_did(State(state): State<ApiState>) -> impl IntoResponse {
    Json(NodeDidResponse {
        did: state.identity.did(),
        peer_id: state.identity.public().to_peer_id().to_string(),
    })
}

/// API error type
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Resolve(ResolveError),
    Publish(PublishError),
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        ApiError::Resolve(e)
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        ApiError::Publish(e)
    }
}

fn resolve_status(e: &ResolveError) -> StatusCode {
    match e {
        ResolveError::MalformedIdentifier(_) => StatusCode::BAD_REQUEST,
        ResolveError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
        ResolveError::RecordNotFound(_) | ResolveError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        ResolveError::TooManyRedirects(_) => StatusCode::LOOP_DETECTED,
        ResolveError::OverlayUnavailable(_) | ResolveError::DnsUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ResolveError::InvalidRecord(_)
        | ResolveError::UnsupportedCodec(_)
        | ResolveError::MalformedPayload(_)
        | ResolveError::StoreReadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn publish_status(e: &PublishError) -> StatusCode {
    match e {
        PublishError::InvalidDocument(_)
        | PublishError::UnsupportedCodec(_)
        | PublishError::UnsupportedHasher(_) => StatusCode::BAD_REQUEST,
        PublishError::OverlayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PublishError::StoreWriteFailed(_) | PublishError::InvalidRecord(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg })).into_response()
            }
            ApiError::Resolve(e) => {
                let status = resolve_status(&e);
                if status.is_server_error() {
                    error!("API resolve error: {}", e);
                }
                let body = serde_json::json!({
                    "didDocument": null,
                    "didDocumentMetadata": {},
                    "didResolutionMetadata": {
                        "error": e.code(),
                        "message": e.to_string(),
                    },
                });
                (status, Json(body)).into_response()
            }
            ApiError::Publish(e) => {
                let status = publish_status(&e);
                if status.is_server_error() {
                    error!("API publish error: {}", e);
                }
                (status, Json(ErrorResponse { error: e.to_string() })).into_response()
            }
        }
    }
}
