//! REST API Handlers
//!
//! Exposes the controller operations over HTTP. Every handler builds a
//! [`RequestContext`] tied to the server's shutdown token, so requests that
//! arrive after shutdown has begun are rejected as cancelled.

use crate::controller::{
    CapacityRange, ControllerExpandVolumeRequest, ControllerServer, CreateSnapshotRequest,
    CreateVolumeRequest, DeleteSnapshotRequest, DeleteVolumeRequest, RequestContext,
    ValidateVolumeCapabilitiesRequest,
};
use crate::error::{Code, Error};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume expansion request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandVolumeBody {
    pub capacity_range: Option<CapacityRange>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    /// Set when the same request should be replayed later
    pub retryable: bool,
}

fn status_for(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let code = e.code();
    if code == Code::Internal {
        error!("Request failed: {}", e);
    }
    (
        status_for(code),
        Json(ApiErrorResponse {
            error: code.to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    controller: Arc<ControllerServer>,
    shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(controller: Arc<ControllerServer>, shutdown: CancellationToken) -> Self {
        Self {
            controller,
            shutdown,
        }
    }

    fn context(&self) -> RequestContext {
        RequestContext::with_cancel(self.shutdown.child_token())
    }
}

/// Build the controller operations router
pub fn router(state: ApiState) -> Router {
    Router::new()
        // Volume endpoints
        .route("/v1/volumes", post(create_volume))
        .route("/v1/volumes/:volume_id", delete(delete_volume))
        .route("/v1/volumes/:volume_id/expand", post(expand_volume))
        .route("/v1/volumes/:volume_id/validate", post(validate_volume))
        // Snapshot endpoints
        .route("/v1/snapshots", post(create_snapshot))
        .route("/v1/snapshots/:snapshot_id", delete(delete_snapshot))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_volume(
    State(state): State<ApiState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Creating volume: {}", request.name);
    match state.controller.create_volume(&state.context(), request).await {
        Ok(volume) => (StatusCode::CREATED, Json(volume)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_volume(State(state): State<ApiState>, Path(volume_id): Path<String>) -> Response {
    info!("Deleting volume: {}", volume_id);
    match state
        .controller
        .delete_volume(&state.context(), DeleteVolumeRequest { volume_id })
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn expand_volume(
    State(state): State<ApiState>,
    Path(volume_id): Path<String>,
    Json(body): Json<ExpandVolumeBody>,
) -> Response {
    let request = ControllerExpandVolumeRequest {
        volume_id,
        capacity_range: body.capacity_range,
    };
    match state.controller.expand_volume(&state.context(), request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn validate_volume(
    State(state): State<ApiState>,
    Path(volume_id): Path<String>,
    Json(request): Json<ValidateVolumeCapabilitiesRequest>,
) -> Response {
    let request = ValidateVolumeCapabilitiesRequest {
        volume_id,
        ..request
    };
    match state
        .controller
        .validate_volume_capabilities(&state.context(), request)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_snapshot(
    State(state): State<ApiState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    info!("Creating snapshot: {}", request.name);
    match state.controller.create_snapshot(&state.context(), request).await {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_snapshot(
    State(state): State<ApiState>,
    Path(snapshot_id): Path<String>,
) -> Response {
    info!("Deleting snapshot: {}", snapshot_id);
    match state
        .controller
        .delete_snapshot(&state.context(), DeleteSnapshotRequest { snapshot_id })
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryCluster;
    use crate::controller::{
        AccessMode, ControllerConfig, ControllerExpandVolumeResponse, Snapshot, Volume,
        VolumeCapability, GIB,
    };

    fn state() -> ApiState {
        let cluster = InMemoryCluster::new();
        cluster.add_filesystem("ceph", "cephfs", "cephfs.meta", 1);
        let controller =
            ControllerServer::new(ControllerConfig::default(), cluster.clone(), cluster).unwrap();
        ApiState::new(Arc::new(controller), CancellationToken::new())
    }

    fn volume_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange::required(GIB)),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)],
            parameters: [("clusterID", "ceph"), ("fsName", "cephfs")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            volume_content_source: None,
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(Code::Aborted), StatusCode::CONFLICT);
        assert_eq!(status_for(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_rest() {
        let state = state();

        let response = create_volume(State(state.clone()), Json(volume_request("pvc-1"))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let volume: Volume = json(response).await;

        let response = create_volume(State(state.clone()), Json(volume_request("pvc-1"))).await;
        let replay: Volume = json(response).await;
        assert_eq!(replay.volume_id, volume.volume_id);

        let response = expand_volume(
            State(state.clone()),
            Path(volume.volume_id.clone()),
            Json(ExpandVolumeBody {
                capacity_range: Some(CapacityRange::required(2 * GIB)),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let expanded: ControllerExpandVolumeResponse = json(response).await;
        assert_eq!(expanded.capacity_bytes, 2 * GIB);

        let response = create_snapshot(
            State(state.clone()),
            Json(CreateSnapshotRequest {
                name: "snap-1".into(),
                source_volume_id: volume.volume_id.clone(),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let snapshot: Snapshot = json(response).await;

        let response = delete_snapshot(State(state.clone()), Path(snapshot.snapshot_id)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = delete_volume(State(state.clone()), Path(volume.volume_id.clone())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Deleting again is still a success
        let response = delete_volume(State(state), Path(volume.volume_id)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_errors_carry_code_and_retryable_flag() {
        let state = state();

        let response = delete_volume(State(state.clone()), Path("not-a-handle".into())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiErrorResponse = json(response).await;
        assert_eq!(body.error, "invalid_argument");
        assert!(!body.retryable);

        let _held = state.controller.volume_locks().lock("pvc-1").unwrap();
        let response = create_volume(State(state.clone()), Json(volume_request("pvc-1"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: ApiErrorResponse = json(response).await;
        assert_eq!(body.error, "aborted");
        assert!(body.retryable);
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_cancelled() {
        let state = state();
        state.shutdown.cancel();

        let response = create_volume(State(state), Json(volume_request("pvc-1"))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ApiErrorResponse = json(response).await;
        assert_eq!(body.error, "cancelled");
    }
}
