//! HTTP API for the maintenance job controller.
//!
//! ## Endpoints
//!
//! - `GET /healthz` - liveness
//! - `GET /api/maintenance` - current / last job
//! - `POST /api/maintenance` - `{action, container?, backup?}` where action is
//!   `backup`, `restore`, `delete` or `cancel`
//! - `GET /api/backups` - backups, newest first
//! - `GET /api/containers` - containers known to the runtime

mod handlers;

use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/maintenance",
            get(handlers::job_status).post(handlers::job_action),
        )
        .route("/api/backups", get(handlers::list_backups))
        .route("/api/containers", get(handlers::list_containers))
        .with_state(WebState { ctx })
}

pub struct WebServer {
    bind_addr: SocketAddr,
    ctx: AppContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            ctx,
            shutdown_tx,
        }
    }

    /// Serve until `shutdown()` is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Maintenance API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
