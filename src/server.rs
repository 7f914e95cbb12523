//! HTTP/WebSocket surface in front of the bus.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::bus::{self, Bus, ConnType};

const PORT_RANGE: std::ops::RangeInclusive<u16> = 8000..=9000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no available ports in range 8000-9000")]
    NoFreePort,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct WsServer {
    listener: TcpListener,
    pub port: u16,
    pub token: String,
    bus: Arc<Bus>,
}

impl WsServer {
    /// Binds the listener up front so the advertised port cannot be lost to
    /// another process between discovery and serving. An empty token is
    /// replaced with a freshly generated one.
    pub async fn bind(token: Option<String>, port: u16) -> Result<Self, ServerError> {
        let listener = if port == 0 {
            find_free_port().await?
        } else {
            TcpListener::bind(("0.0.0.0", port)).await?
        };
        let port = listener.local_addr()?.port();
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => generate_token(),
        };
        let bus = Bus::new(token.clone());
        Ok(Self {
            listener,
            port,
            token,
            bus,
        })
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub async fn serve(self) -> io::Result<()> {
        axum::serve(self.listener, build_router(self.bus)).await
    }

    /// Serves until SIGINT/SIGTERM, then cancels every session.
    pub async fn serve_until_signalled(self) -> io::Result<()> {
        let bus = self.bus.clone();
        axum::serve(self.listener, build_router(self.bus))
            .with_graceful_shutdown(async move {
                wait_for_termination().await;
                bus.shutdown();
            })
            .await
    }
}

async fn find_free_port() -> Result<TcpListener, ServerError> {
    for port in PORT_RANGE {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok(listener);
        }
    }
    Err(ServerError::NoFreePort)
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

pub fn build_router(bus: Arc<Bus>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{type}", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(bus)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    #[serde(rename = "processId")]
    process_id: Option<String>,
}

async fn ws_handler(
    State(bus): State<Arc<Bus>>,
    Path(conn_type): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(conn_type) = conn_type.parse::<ConnType>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(process_id) = query.process_id.filter(|p| !p.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if !bus.token_matches(&token) {
        warn!(%conn_type, %process_id, "unauthorized connection attempt");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match conn_type {
        // Subscribers can only join a live session.
        ConnType::Client if bus.session(&process_id).is_none() => {
            return StatusCode::NOT_FOUND.into_response();
        }
        // The first producer owns the id until it disconnects.
        ConnType::Process if bus.session(&process_id).is_some() => {
            return StatusCode::CONFLICT.into_response();
        }
        _ => {}
    }

    ws.on_upgrade(move |socket| bus::handle_socket(bus, conn_type, process_id, socket))
}
