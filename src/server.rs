//! HTTP Server
//!
//! Axum server with two faces:
//! - `POST /events`: inbound events pushed by the bridge
//! - `/admin/*`: JSON admin endpoints over [`Admin`]
//!
//! Shuts down gracefully on Ctrl+C or SIGTERM.

use crate::admin::{Admin, AdminError};
use crate::channels::InboundEvent;
use crate::engine::RelayEngine;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Log every request via `TraceLayer`
    pub log_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            log_requests: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn is_localhost(&self) -> bool {
        self.bind_addr.is_loopback()
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<RelayEngine>,
    admin: Admin,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::UnknownConversation(_) => StatusCode::NOT_FOUND,
            AdminError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdminError::Channel(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            error!("Admin request failed: {}", self);
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct AddMemoryRequest {
    user_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct UpdateMemoryRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct AllowedGroupsRequest {
    groups: Vec<String>,
}

fn found_or_404(ok: bool) -> StatusCode {
    if ok {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Build the router for an engine
pub fn router(engine: Arc<RelayEngine>) -> Router {
    let state = AppState {
        admin: Admin::new(engine.clone()),
        engine,
    };

    let admin = Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/{id}", get(conversation_details))
        .route("/conversations/{id}/users", get(conversation_users))
        .route("/conversations/{id}/users/{user}/memories", get(user_memories))
        .route(
            "/conversations/{id}/memories",
            post(add_memory).delete(clear_memories),
        )
        .route(
            "/conversations/{id}/memories/{index}",
            put(update_memory).delete(delete_memory),
        )
        .route(
            "/conversations/{id}/users/{user}/context/{index}",
            delete(delete_context_line),
        )
        .route("/groups", get(list_groups))
        .route("/groups/allowed", put(update_allowed_groups))
        .route("/sync", post(sync_now));

    Router::new()
        .route("/events", post(receive_event))
        .route("/health", get(health))
        .nest("/admin", admin)
        .with_state(state)
}

/// Relay HTTP server
pub struct RelayServer {
    config: ServerConfig,
    engine: Arc<RelayEngine>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, engine: Arc<RelayEngine>) -> Self {
        Self { config, engine }
    }

    /// Serve until Ctrl+C/SIGTERM, then flip the engine's shutdown flag
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let mut app = router(self.engine.clone());
        if self.config.log_requests {
            app = app.layer(TraceLayer::new_for_http());
        }

        if !self.config.is_localhost() {
            warn!("Admin endpoints exposed on {} without authentication", addr);
        }

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);

        let engine = self.engine.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                engine.shutdown();
            })
            .await?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

async fn receive_event(State(state): State<AppState>, Json(event): Json<InboundEvent>) -> StatusCode {
    let id = event.id.clone();
    match state.engine.handle_event(event).await {
        Ok(_) => debug!("Event {} dispatched", id),
        Err(rejection) => debug!("Event {} not dispatched: {:?}", id, rejection),
    }
    StatusCode::ACCEPTED
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = &state.engine;
    let connected = engine.client().is_connected();
    let status = if connected { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "connected": connected,
        "engine": engine.stats(),
        "sessions": engine.context().sessions.stats(),
        "conversations": engine.context().registry.len().await,
    }))
}

async fn list_conversations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admin.memory_summaries().await)
}

async fn conversation_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    Ok(Json(state.admin.conversation_details(&id).await?))
}

async fn conversation_users(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    Ok(Json(state.admin.users_in_conversation(&id)?))
}

async fn user_memories(
    State(state): State<AppState>,
    Path((id, user)): Path<(String, String)>,
) -> Result<impl IntoResponse, AdminError> {
    let session = state.admin.user_memories(&id, &user);
    let persisted = state.admin.persisted_memories(&id, &user)?;
    Ok(Json(json!({"session": session, "persisted": persisted})))
}

async fn add_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddMemoryRequest>,
) -> Result<StatusCode, AdminError> {
    let added = state.admin.add_memory(&id, &body.user_id, &body.content).await?;
    Ok(if added { StatusCode::CREATED } else { StatusCode::NOT_FOUND })
}

async fn update_memory(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
    Json(body): Json<UpdateMemoryRequest>,
) -> Result<StatusCode, AdminError> {
    Ok(found_or_404(state.admin.update_memory(&id, index, &body.content)?))
}

async fn delete_memory(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<StatusCode, AdminError> {
    Ok(found_or_404(state.admin.delete_memory(&id, index)?))
}

async fn clear_memories(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let deleted = state.admin.clear_memories(&id)?;
    Ok(Json(json!({"deleted": deleted})))
}

async fn delete_context_line(
    State(state): State<AppState>,
    Path((id, user, index)): Path<(String, String, usize)>,
) -> StatusCode {
    found_or_404(state.admin.delete_context_line(&id, &user, index))
}

async fn list_groups(State(state): State<AppState>) -> Result<impl IntoResponse, AdminError> {
    Ok(Json(state.admin.groups().await?))
}

async fn update_allowed_groups(
    State(state): State<AppState>,
    Json(body): Json<AllowedGroupsRequest>,
) -> impl IntoResponse {
    state.admin.update_allowed_groups(body.groups);
    Json(json!({"allowed_groups": state.engine.allowed_groups()}))
}

async fn sync_now(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admin.sync_now().await)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Models;
    use crate::memory::SqliteMemoryStore;
    use crate::testing::{FakeModel, FakeNetwork};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<FakeNetwork>, Arc<RelayEngine>) {
        let network = Arc::new(FakeNetwork::new());
        network.add_group("1203@g.us", "Family");
        let mut config = Config::default();
        config.bot.allowed_groups = vec!["1203".to_string()];
        let engine = RelayEngine::with_models(
            &config,
            network.clone(),
            Arc::new(SqliteMemoryStore::open_in_memory().unwrap()),
            Models {
                chat: Arc::new(FakeModel::new("pong")),
                vision: Arc::new(FakeModel::new("pong")),
            },
        );
        (router(engine.clone()), network, engine)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["engine"]["received"], 0);
    }

    #[tokio::test]
    async fn test_events_are_accepted() {
        let (app, _, engine) = app();
        let event = json!({
            "id": "M1",
            "chat_id": "1203@g.us",
            "sender_id": "alice@s.whatsapp.net",
            "is_group": true,
            "message": {"type": "conversation", "text": "lunch?"}
        });

        let response = app.oneshot(json_request("POST", "/events", event)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(engine.stats().received, 1);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_memory_endpoints() {
        let (app, network, engine) = app();
        let conv = engine
            .context()
            .registry
            .get_or_create("1203@g.us", network.as_ref())
            .await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/admin/conversations/{}/memories", conv),
                json!({"user_id": "bob", "content": "likes chess"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/admin/conversations/{}/users/bob/memories", conv))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["session"]["memories"][0]["content"], "likes chess");
        assert_eq!(body["persisted"][0]["content"], "likes chess");

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/admin/conversations/{}/memories/5", conv),
                json!({"content": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/conversations/whatsapp-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_allowed_groups() {
        let (app, _, engine) = app();
        let response = app
            .oneshot(json_request("PUT", "/admin/groups/allowed", json!({"groups": ["*"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.is_allowed("9999@g.us"));
    }
}
