//! Internal configuration API
//!
//! Called by the management service when servers, namespaces or API keys
//! change. Upserts invalidate the idle sessions built from the old
//! configuration; live connections keep running until their clients leave.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use metamcp_shared::{ApiKeyBinding, Namespace, NamespaceId, NamespaceSnapshot, ServerId, ServerParameters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::metamcp::MetaMcpStatus;
use crate::pool::PoolStatus;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerChangeResponse {
    pub uuid: ServerId,
    pub affected_namespaces: Vec<NamespaceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRequest {
    pub name: String,
    #[serde(default)]
    pub server_uuids: Vec<ServerId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateNamespacesRequest {
    pub namespace_uuids: Vec<NamespaceId>,
}

#[derive(Debug, Serialize)]
pub struct PoolOverview {
    pub pool: PoolStatus,
    pub metamcp: MetaMcpStatus,
    pub sessions: usize,
}

/// `PUT /api/servers/:uuid`
pub async fn upsert_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(mut params): Json<ServerParameters>,
) -> ApiResult<Json<ServerChangeResponse>> {
    params.uuid = uuid.into();
    let server_uuid = params.uuid;

    let affected = state.repository.upsert_server(params.clone()).await?;
    tracing::info!(server = %params.name, server_uuid = %server_uuid, "Server configuration updated");

    state.pool.invalidate_idle_session(server_uuid, Some(params)).await;
    state.metamcp.invalidate_idle_servers(&affected).await;

    Ok(Json(ServerChangeResponse {
        uuid: server_uuid,
        affected_namespaces: affected,
    }))
}

/// `POST /api/servers/:uuid/invalidate`
pub async fn invalidate_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<ServerChangeResponse>> {
    let server_uuid = ServerId::from(uuid);
    let params = state.repository.server(server_uuid).await;
    let affected = state.repository.namespaces_containing(server_uuid).await;

    state.pool.invalidate_idle_session(server_uuid, params).await;
    state.metamcp.invalidate_idle_servers(&affected).await;

    Ok(Json(ServerChangeResponse {
        uuid: server_uuid,
        affected_namespaces: affected,
    }))
}

/// `PUT /api/namespaces/:uuid`
pub async fn upsert_namespace(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<NamespaceRequest>,
) -> ApiResult<Json<NamespaceSnapshot>> {
    let namespace_uuid = NamespaceId::from(uuid);
    state
        .repository
        .upsert_namespace(Namespace {
            uuid: namespace_uuid,
            name: request.name,
            server_uuids: request.server_uuids,
        })
        .await?;

    state.metamcp.invalidate_idle_servers(&[namespace_uuid]).await;

    let snapshot = state
        .repository
        .namespace(namespace_uuid)
        .await
        .ok_or(ApiError::NotFound)?;
    tracing::info!(namespace = %snapshot.name, namespace_uuid = %namespace_uuid, "Namespace updated");

    Ok(Json(snapshot))
}

/// `POST /api/namespaces/invalidate`
pub async fn invalidate_namespaces(
    State(state): State<AppState>,
    Json(request): Json<InvalidateNamespacesRequest>,
) -> StatusCode {
    state
        .metamcp
        .invalidate_idle_servers(&request.namespace_uuids)
        .await;
    StatusCode::NO_CONTENT
}

/// `POST /api/api-keys`
pub async fn bind_api_key(
    State(state): State<AppState>,
    Json(binding): Json<ApiKeyBinding>,
) -> ApiResult<StatusCode> {
    let namespace_uuid = binding.namespace_uuid;
    state.repository.bind_api_key(binding).await?;
    tracing::info!(namespace_uuid = %namespace_uuid, "API key bound");
    Ok(StatusCode::CREATED)
}

/// `GET /api/namespaces/current`
///
/// Resolves the bearer API key to its namespace. The `aggregate`
/// subcommand reads its configuration from here.
pub async fn current_namespace(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<NamespaceSnapshot>> {
    let auth_header = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let api_key = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    state
        .repository
        .namespace_for_api_key(api_key)
        .await
        .map(Json)
        .ok_or(ApiError::InvalidApiKey)
}

/// `GET /api/pool`
pub async fn pool_status(State(state): State<AppState>) -> Json<PoolOverview> {
    Json(PoolOverview {
        pool: state.pool.status(),
        metamcp: state.metamcp.status(),
        sessions: state.sessions.len(),
    })
}
