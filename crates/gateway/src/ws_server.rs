//! Observer-facing WebSocket and HTTP endpoint.
//!
//! `GET /ws` upgrades to the bidirectional JSON channel; `/health` reports
//! liveness; everything else (including `/`) is served from the static
//! directory holding the map UI.

use crate::error::Result;
use crate::ingress::Ingress;
use crate::observer::{ObserverRegistry, ObserverState};
use crate::protocol::InboundFrame;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub observers: Arc<ObserverRegistry>,
    pub ingress: Ingress,
}

/// Create the observer router.
pub fn create_router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","observers":{},"devices":{}}}"#,
        state.observers.len(),
        state.ingress.registry.len()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle one observer connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Unbounded channel so broadcasts never block on this socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let observer = Arc::new(ObserverState::new(tx));
    let observer_id = observer.id;

    // Registration sends the initial snapshot through the channel; if the
    // socket is already gone there is nothing to do.
    if state.observers.register(observer.clone()).is_err() {
        return;
    }
    info!(observer = %observer_id, "observer connected");

    // Forward queued messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, msg) {
                            // Bad input never costs the connection.
                            warn!(observer = %observer_id, error = %e, "dropping observer message");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(observer = %observer_id, error = %e, "observer socket error");
                        break;
                    }
                    None => break,
                }
            }

            // Keepalive ping rides the same per-observer channel as data.
            _ = ping_interval.tick() => {
                if observer.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    state.observers.unregister(&observer_id);
    send_task.abort();
    info!(observer = %observer_id, "observer disconnected");
}

/// Handle one inbound observer frame.
fn handle_message(state: &Arc<AppState>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => handle_frame(state, text.as_str()),
        Message::Binary(data) => {
            let text = std::str::from_utf8(&data)
                .map_err(|e| crate::error::GatewayError::ObserverPayload(e.to_string()))?;
            handle_frame(state, text)
        }
        // Axum answers pings itself; pongs and close are noise here.
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => Ok(()),
    }
}

/// Parse and ingest one JSON document from an observer.
fn handle_frame(state: &Arc<AppState>, text: &str) -> Result<()> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    let kind = frame.kind.clone();

    let Some(states) = frame.ingress_states() else {
        debug!(kind = %kind, "ignoring observer frame");
        return Ok(());
    };

    for incoming in states? {
        let merged = state.ingress.synthetic(incoming)?;
        debug!(imei = %merged.imei, "synthetic update ingested");
    }

    Ok(())
}
