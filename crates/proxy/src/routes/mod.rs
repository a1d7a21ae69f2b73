//! HTTP routes

pub mod health;
pub mod internal;
pub mod logs;
pub mod metamcp;
pub mod session;
pub mod sse;
pub mod streamable_http;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderName,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::transport::headers::MCP_SESSION_ID;

/// Global request body limit
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Direct sessions: one backend server per client session
    let proxy_routes = Router::new()
        .route("/sse", get(sse::connect))
        .route("/message", post(sse::post_message))
        .route(
            "/mcp",
            post(streamable_http::post)
                .get(streamable_http::stream)
                .delete(streamable_http::delete),
        );

    // Namespace sessions: every active server of the namespace behind one key
    let metamcp_routes = Router::new()
        .route("/metamcp/:api_key/sse", get(metamcp::sse))
        .route("/metamcp/:api_key/message", post(metamcp::post_message))
        .route(
            "/metamcp/:api_key/mcp",
            post(metamcp::post).get(metamcp::stream).delete(metamcp::delete),
        );

    // Configuration and observability for the management service
    let internal_routes = Router::new()
        .route("/servers/:uuid", put(internal::upsert_server))
        .route("/servers/:uuid/invalidate", post(internal::invalidate_server))
        .route("/namespaces/current", get(internal::current_namespace))
        .route("/namespaces/invalidate", post(internal::invalidate_namespaces))
        .route("/namespaces/:uuid", put(internal::upsert_namespace))
        .route("/api-keys", post(internal::bind_api_key))
        .route("/pool", get(internal::pool_status))
        .route("/logs", get(logs::list).delete(logs::clear))
        .route("/logs/stream", get(logs::stream));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(MCP_SESSION_ID)]);

    Router::new()
        .merge(health_routes)
        .merge(proxy_routes)
        .merge(metamcp_routes)
        .nest("/api", internal_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
