//! Arbor Server - WebSocket host for replicated runtime stores.
//!
//! One game loop task owns the authoritative stores and the replication
//! server. Socket tasks and HTTP handlers talk to it over a channel, and it
//! hands outgoing frames back through the connection manager.

mod config;
mod error;
mod game;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::game::Game;
use crate::websocket::{ConnectionManager, EventSender};
use axum::Router;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    pub events: EventSender,
}

/// Build the HTTP router around shared state.
fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor_server=debug,arbor=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Arbor Server on {}:{}", config.host, config.port);

    let registry = game::load_registry(config.manifest_path.as_deref())?;

    // Start the game loop
    let conn_manager = ConnectionManager::new_shared();
    let (events, event_rx) = mpsc::unbounded_channel();
    let game = Game::new(&config, registry);
    tokio::spawn(game.run(event_rx, conn_manager.clone(), config.tick_interval));

    let state = AppState {
        config: Arc::new(config.clone()),
        conn_manager,
        events,
    };
    let app = build_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
