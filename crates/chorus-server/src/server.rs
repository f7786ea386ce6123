use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use chorus_core::events::now_nanos;
use chorus_core::ChatHistory;

use crate::config::ServerConfig;
use crate::node::Node;
use crate::registry::{Transport, TransportError};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/messages", get(messages_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve `node` until the handle is stopped.
pub async fn start(config: ServerConfig, node: Arc<Node>) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        node,
        config: Arc::new(config),
    };
    let router = build_router(state);

    tracing::info!(port = local_addr.port(), "Chorus server started");

    let stop = CancellationToken::new();
    let graceful = stop.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        stop,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    stop: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop taking new connections. Connections already upgraded keep
    /// running until the node closes them.
    pub fn stop_accepting(&self) {
        self.stop.cancel();
    }

    /// Stop accepting requests and wait for the listener task to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.server.await;
    }
}

/// Write half of an upgraded websocket.
pub struct WsTransport {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();

    // Text frames only; the read side ends on close or the first error.
    let inbound = stream
        .take_while(|msg| futures::future::ready(matches!(msg, Ok(m) if !matches!(m, WsMessage::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Text(text)) => Some(text.to_string()),
                _ => None,
            }
        });

    state
        .node
        .coordinator
        .run_connection(WsTransport { sink }, Box::pin(inbound))
        .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    if node.reconciler.is_exiting() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "exiting" })),
        );
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "connections": node.registry.count(),
            "fanout": node.bus.is_started(),
        })),
    )
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(rename = "lastTimestamp")]
    last_timestamp: Option<i64>,
}

/// One page of history strictly older than `lastTimestamp`, newest first.
async fn messages_handler(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Response {
    let before = params.last_timestamp.unwrap_or_else(now_nanos);
    let limit = state.config.store_timeout;

    match tokio::time::timeout(limit, state.node.history.page_messages(before)).await {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, kind = e.error_kind(), "History page failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "History page timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(serde_json::json!({ "error": "history store timed out" })),
            )
                .into_response()
        }
    }
}
