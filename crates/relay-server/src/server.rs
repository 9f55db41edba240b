use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use relay_store::HistoryReader;
use relay_telemetry::IncidentJournal;

use crate::avatar::AvatarBroker;
use crate::connection::{self, ChannelConfig};
use crate::handlers::HandlerState;
use crate::history;
use crate::registry::SessionRegistry;
use crate::settings::RelaySettings;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub channel: ChannelConfig,
    /// Default page size for `GET /api/sessions`.
    pub history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            cors_origin: "*".into(),
            channel: ChannelConfig::default(),
            history_limit: 50,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            cors_origin: settings.server.cors_origin.clone(),
            channel: ChannelConfig {
                max_send_queue: settings.server.max_send_queue,
                heartbeat_interval: settings.server.heartbeat_interval(),
                client_timeout: settings.server.client_timeout(),
            },
            history_limit: settings.persistence.history_limit,
        }
    }
}

/// Collaborators the server is assembled from.
pub struct Services {
    pub handler_state: Arc<HandlerState>,
    /// `None` when persistence is disabled.
    pub history: Option<HistoryReader>,
    pub avatar: Arc<AvatarBroker>,
    pub incidents: Option<Arc<IncidentJournal>>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub history: Option<HistoryReader>,
    pub avatar: Arc<AvatarBroker>,
    pub incidents: Option<Arc<IncidentJournal>>,
    pub channel: ChannelConfig,
    pub history_limit: u32,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(services: Services, config: &ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            handler_state: services.handler_state,
            history: services.history,
            avatar: services.avatar,
            incidents: services.incidents,
            channel: config.channel,
            history_limit: config.history_limit,
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/sessions", get(history::list_sessions))
        .route("/api/sessions/{id}", get(history::get_session))
        .route("/api/logs", get(history::list_incidents))
        .route("/api/heygen/token", post(history::avatar_token))
        .with_state(state)
        .layer(cors_layer(cors_origin))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            warn!(origin, "invalid CORS origin, allowing any");
            CorsLayer::permissive()
        }
    }
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, services: Services) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let registry = Arc::clone(&services.handler_state.registry);
    let state = AppState::new(services, &config, shutdown.clone());
    let router = build_router(state, &config.cors_origin);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), host = %config.host, "relay server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        registry,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    registry: Arc<SessionRegistry>,
}

impl ServerHandle {
    pub fn active_sessions(&self) -> usize {
        self.registry.count()
    }

    /// Stop accepting connections, close open sockets and tear down every session.
    pub async fn shutdown(mut self) {
        info!(active_sessions = self.registry.count(), "shutting down");
        self.shutdown.cancel();
        self.registry.shutdown_all().await;
        if tokio::time::timeout(Duration::from_secs(5), &mut self.server)
            .await
            .is_err()
        {
            warn!("server did not drain in time, aborting");
            self.server.abort();
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::serve_socket(socket, state.handler_state, state.channel, state.shutdown)
    })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "persistenceEnabled": state.handler_state.persistence.is_enabled(),
        "avatarEnabled": state.avatar.is_enabled(),
        "activeSessions": state.handler_state.registry.count(),
    }))
}
