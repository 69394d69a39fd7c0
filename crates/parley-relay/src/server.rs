//! Axum WebSocket server in front of the [`SignallingRelay`].
//!
//! # Routes
//!
//! - `GET /` and `GET /ws`: WebSocket upgrade for the relay protocol
//! - `GET /health`: liveness probe
//! - `GET /api/v1/stats`: room, client and connection counts
//!
//! On shutdown every open socket receives a close frame with code 1001
//! before the listener stops.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::relay::{RelayStats, SignallingRelay};

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    relay: Arc<SignallingRelay>,
    shutdown: watch::Receiver<bool>,
}

/// Relay server.
pub struct RelayServer {
    relay: Arc<SignallingRelay>,
    config: RelayConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a server with a fresh registry sized from `config`.
    pub fn new(config: RelayConfig) -> Self {
        let relay = Arc::new(SignallingRelay::new(Registry::new(config.max_room_size)));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            relay,
            config,
            shutdown_tx,
        }
    }

    /// The relay core (for in-process use and tests).
    pub fn relay(&self) -> Arc<SignallingRelay> {
        Arc::clone(&self.relay)
    }

    /// Build the router for the server.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            shutdown: self.shutdown_tx.subscribe(),
        };

        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/api/v1/stats", get(stats_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, signal).await
    }

    /// Serve on an already-bound listener until `signal` resolves.
    pub async fn serve<F>(self, listener: tokio::net::TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Signalling server running on {}", listener.local_addr()?);

        let router = self.router();
        let shutdown_tx = self.shutdown_tx;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("Shutting down server...");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        info!("Server shut down");
        Ok(())
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn stats_handler(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.stats().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump frames between one WebSocket and the relay until either side closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outbound) = mpsc::unbounded_channel::<String>();
    let connection = state.relay.connect(outbox).await;
    let mut shutdown = state.shutdown.clone();
    info!("Client connected ({})", connection);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("Failed to send to {}: {}", connection, e);
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.relay.handle_text(connection, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        state.relay.handle_bytes(connection, &bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", connection, e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: String::from("Server shutting down").into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("Error closing {}: {}", connection, e);
                }
                break;
            }
        }
    }

    state.relay.disconnect(connection).await;
    info!("Client disconnected ({})", connection);
}
