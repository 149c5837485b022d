//! HTTP routes
//!
//! Thin shell over the lifecycle coordinator: request parsing, error-kind
//! to status-code mapping, and the installer upload stream. All state
//! changes happen in the core.

use crate::auth::AuthedUser;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use vmshare_common::types::{LaunchKind, LaunchRequest, ProfileTag};
use vmshare_common::Error;
use vmshare_core::{Coordinator, RemoveTarget};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/run-script", post(run_script))
        .route("/api/run-iso", post(run_iso))
        .route("/api/run-snapshot", post(run_snapshot))
        .route("/api/snapshot", post(snapshot))
        .route("/api/remove-snapshot", post(remove_snapshot))
        .route("/api/get-user-snapshots", get(get_user_snapshots))
        .route("/api/logout", post(logout))
        .route("/api/sessions/active", get(sessions_active))
        .route(
            "/api/upload-iso",
            post(upload_iso).layer(DefaultBodyLimit::disable()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Error wrapper carrying the HTTP mapping of the core error kinds.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn status(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidInput(_)
            | Error::UnknownProfile(_)
            | Error::ProfileIsInstallerOnly(_)
            | Error::NotABootableImage(_) => StatusCode::BAD_REQUEST,
            Error::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::ImageMissing(_)
            | Error::ImageNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::NoRunningVm(_) => StatusCode::NOT_FOUND,
            Error::VmNotRunning(_) | Error::AlreadyAttached(_) => StatusCode::CONFLICT,
            Error::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {err}");
        }
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn parse_profile(tag: &str) -> Result<ProfileTag, ApiError> {
    tag.parse::<ProfileTag>().map_err(ApiError::from)
}

// ============================================================================
// Launch
// ============================================================================

#[derive(Debug, Deserialize)]
struct RunScriptRequest {
    os_profile: String,
}

async fn run_script(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<RunScriptRequest>,
) -> Result<Response, ApiError> {
    let profile = parse_profile(&body.os_profile)?;
    let view = state
        .coordinator
        .launch(
            &user.user_id,
            LaunchRequest {
                profile,
                kind: LaunchKind::Profile,
            },
        )
        .await?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct RunIsoRequest {
    data_disk_gb: Option<u32>,
    /// Name of a pre-provisioned install-target disk to attach.
    install_target: Option<String>,
}

async fn run_iso(
    State(state): State<AppState>,
    user: AuthedUser,
    body: Option<Json<RunIsoRequest>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let view = state
        .coordinator
        .launch(
            &user.user_id,
            LaunchRequest {
                profile: ProfileTag::Custom,
                kind: LaunchKind::Installer {
                    data_disk_gb: body.data_disk_gb,
                    install_target: body.install_target,
                },
            },
        )
        .await?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Deserialize)]
struct RunSnapshotRequest {
    os_profile: String,
    snapshot_name: String,
}

async fn run_snapshot(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<RunSnapshotRequest>,
) -> Result<Response, ApiError> {
    if body.snapshot_name.trim().is_empty() {
        return Err(ApiError::from(Error::InvalidInput(
            "snapshot_name is required".to_string(),
        )));
    }
    let profile = parse_profile(&body.os_profile)?;
    let view = state
        .coordinator
        .launch(
            &user.user_id,
            LaunchRequest {
                profile,
                kind: LaunchKind::Snapshot {
                    name: body.snapshot_name,
                },
            },
        )
        .await?;
    Ok(Json(view).into_response())
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    os_profile: String,
    instance_id: Option<String>,
}

async fn snapshot(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<SnapshotRequest>,
) -> Result<Response, ApiError> {
    let profile = parse_profile(&body.os_profile)?;
    let outcome = state
        .coordinator
        .create_snapshot(&user.user_id, profile, body.instance_id)
        .await?;
    Ok(Json(json!({
        "name": outcome.name,
        "path": outcome.path,
        "size_mb": outcome.size_mb,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct RemoveSnapshotRequest {
    snapshot: Option<String>,
    os_profile: Option<String>,
    instance_id: Option<String>,
}

async fn remove_snapshot(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<RemoveSnapshotRequest>,
) -> Result<Response, ApiError> {
    let target = match (body.snapshot, body.os_profile, body.instance_id) {
        (Some(name), _, _) => RemoveTarget::Name(name),
        (None, Some(os_profile), Some(instance_id)) => RemoveTarget::Instance {
            os_profile: parse_profile(&os_profile)?,
            instance_id,
        },
        _ => {
            return Err(ApiError::from(Error::InvalidInput(
                "pass either snapshot or os_profile with instance_id".to_string(),
            )))
        }
    };
    let outcome = state
        .coordinator
        .remove_snapshot(&user.user_id, target)
        .await?;
    Ok(Json(json!({
        "removed": outcome.removed,
        "freed_mb": outcome.freed_mb,
        "total_mb": outcome.total_mb,
    }))
    .into_response())
}

async fn get_user_snapshots(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Response, ApiError> {
    let snapshots = state.coordinator.list_user_snapshots(&user.user_id).await?;
    Ok(Json(snapshots).into_response())
}

// ============================================================================
// Sessions
// ============================================================================

async fn logout(State(state): State<AppState>, user: AuthedUser) -> Response {
    state.coordinator.logout(&user.user_id).await;
    Json(json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

async fn sessions_active(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let sessions = state
        .coordinator
        .active_sessions(query.user_id.as_deref(), limit)?;
    Ok(Json(sessions).into_response())
}

// ============================================================================
// Installer upload
// ============================================================================

async fn upload_iso(
    State(state): State<AppState>,
    user: AuthedUser,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let dest = state.coordinator.installer_upload_path(&user.user_id)?;
    let max_bytes = state.coordinator.config().upload.max_installer_bytes;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::status(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::from(Error::Io(e)))?;
        }

        info!(
            "Saving installer upload for user {} to {}",
            user.user_id,
            dest.display()
        );
        // Truncates any previous upload; the target file starts clean.
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| ApiError::from(Error::Io(e)))?;
        let mut total: u64 = 0;

        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Err(ApiError::status(StatusCode::BAD_REQUEST, e.to_string()));
                }
            };
            total += chunk.len() as u64;
            if total > max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&dest).await;
                warn!(
                    "Installer upload for user {} exceeded the {} byte cap",
                    user.user_id, max_bytes
                );
                return Err(ApiError::status(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "File too large",
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::from(Error::Io(e)))?;
        }
        file.flush().await.map_err(|e| ApiError::from(Error::Io(e)))?;

        info!(
            "Saved installer for user {} ({} bytes)",
            user.user_id, total
        );
        return Ok(Json(json!({
            "message": "installer uploaded",
            "user_id": user.user_id,
            "iso_path": dest,
            "size": total,
        }))
        .into_response());
    }

    Err(ApiError::from(Error::InvalidInput(
        "multipart field 'file' is required".to_string(),
    )))
}
