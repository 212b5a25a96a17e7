mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{RawQuery, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tandem_api::auth::{self, AppState, AppStateInner};
use tandem_gateway::auth::{Authenticator, token_from_request};
use tandem_gateway::chat::ChatService;
use tandem_gateway::connection;
use tandem_gateway::dispatcher::Dispatcher;
use tandem_gateway::error::ChatError;

use crate::config::ServerConfig;

#[derive(Clone)]
struct ServerState {
    chat: ChatService,
    authenticator: Authenticator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tandem_gateway=debug,tandem_api=debug,tandem_db=info,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    info!(db_path = %config.db_path.display(), port = config.port, "Loaded configuration");

    // Init database
    let db = Arc::new(tandem_db::Database::open(&config.db_path)?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let chat = ChatService::new(db.clone(), dispatcher.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl_days: config.token_ttl_days,
    });

    let state = ServerState {
        chat,
        authenticator: Authenticator::new(config.jwt_secret.clone()),
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/health", get(|| async { "ok" }))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr();
    info!("Tandem server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    info!("Tandem server stopped");

    Ok(())
}

/// Authenticate before upgrading: a connection without a valid credential
/// never joins a room or shows up in presence.
async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let token = token_from_request(&headers, query.as_deref());

    let identity = match state
        .authenticator
        .authenticate(state.chat.db(), token.as_deref())
        .await
    {
        Ok(identity) => identity,
        Err(ChatError::Store(e)) => {
            warn!("Gateway handshake failed: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(e) => {
            warn!("Gateway handshake rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.chat, identity))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
