//! HTTP server receiving progress POSTs from remote scripts.
//!
//! ## Endpoints
//!
//! | Route                     | Response                                      |
//! |---------------------------|-----------------------------------------------|
//! | `GET /health`             | `200 ok`                                      |
//! | `POST /progress/{token}`  | `200` accepted                                |
//! |                           | `400` malformed message                       |
//! |                           | `404` no endpoint registered for the token    |
//! |                           | `409` message after the step resolved         |
//!
//! ## Usage
//!
//! ```no_run
//! use reshard_phase::config::ProgressConfig;
//! use reshard_phase::progress::ProgressServer;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut server = ProgressServer::start(&ProgressConfig::default()).await?;
//! let endpoint = server.hub().register();
//! // Hand endpoint.url() to the remote script...
//! server.stop();
//! # Ok(())
//! # }
//! ```

use super::{DeliveryError, ProgressHub, ProgressMessage};
use crate::config::ProgressConfig;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A running progress server and the hub it feeds.
pub struct ProgressServer {
    hub: ProgressHub,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProgressServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid or cannot be bound.
    pub async fn start(config: &ProgressConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()?)
            .await
            .context("Failed to bind progress server")?;

        let addr = listener
            .local_addr()
            .context("Failed to get progress server address")?;

        let host = match &config.advertise_host {
            Some(host) if !host.is_empty() => host.clone(),
            _ => addr.ip().to_string(),
        };
        let hub = ProgressHub::new(&format!("http://{}:{}", host, addr.port()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = build_router(hub.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "progress server error");
            }
        });

        tracing::info!(addr = %addr, base_url = hub.base_url(), "progress server listening");

        Ok(Self {
            hub,
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Stop accepting connections.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProgressServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the axum router serving `hub`.
pub fn build_router(hub: ProgressHub) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/progress/{token}", post(progress_handler))
        .with_state(hub)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn progress_handler(
    State(hub): State<ProgressHub>,
    Path(token): Path<String>,
    Json(message): Json<ProgressMessage>,
) -> (StatusCode, String) {
    match hub.deliver(&token, message) {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            tracing::warn!(token = %token, error = %e, "rejected progress message");
            let status = match e {
                DeliveryError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
                DeliveryError::AfterEnd => StatusCode::CONFLICT,
                DeliveryError::Malformed(_) => StatusCode::BAD_REQUEST,
            };
            (status, e.to_string())
        }
    }
}
