// gateway/mod.rs — External gateway: the HTTP surface the canvas and
// external senders talk to.
//
// Axum server on LISTEN_ADDR. Endpoints under /api/v1:
//   GET  /health
//   GET/PUT /swarm
//   GET/POST /nodes                  DELETE /nodes/{id}
//   POST /nodes/{id}/start /stop     GET /nodes/{id}/status
//   GET  /nodes/{id}/hierarchy /transcript /inbox /outbox
//   POST/DELETE /connections         PUT /connections/bidirectional
//   GET  /connections /connections/cycles
//   POST /mail                       GET /mail/counts
//   GET  /human/inbox /outbox
//   GET  /events                     (SSE)
//   POST /files   GET /files/{id}  GET /files/{id}/meta
//   GET/PUT /canvas

pub mod files;
pub mod routes;
pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn serve(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = ctx
        .config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", ctx.config.listen_addr))?;
    let router = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health))
        // Swarm configuration
        .route("/api/v1/swarm", get(routes::swarm_get).put(routes::swarm_put))
        // Nodes
        .route("/api/v1/nodes", get(routes::node_list).post(routes::node_add))
        .route("/api/v1/nodes/{id}", delete(routes::node_remove))
        .route("/api/v1/nodes/{id}/start", post(routes::node_start))
        .route("/api/v1/nodes/{id}/stop", post(routes::node_stop))
        .route("/api/v1/nodes/{id}/status", get(routes::node_status))
        .route("/api/v1/nodes/{id}/hierarchy", get(routes::node_hierarchy))
        .route("/api/v1/nodes/{id}/transcript", get(routes::node_transcript))
        .route("/api/v1/nodes/{id}/inbox", get(routes::node_inbox))
        .route("/api/v1/nodes/{id}/outbox", get(routes::node_outbox))
        // Connections
        .route(
            "/api/v1/connections",
            post(routes::conn_add).delete(routes::conn_remove).get(routes::conn_list),
        )
        .route(
            "/api/v1/connections/bidirectional",
            put(routes::conn_set_bidirectional),
        )
        .route("/api/v1/connections/cycles", get(routes::conn_cycles))
        // Mail
        .route("/api/v1/mail", post(routes::mail_send))
        .route("/api/v1/mail/counts", get(routes::mail_counts))
        .route("/api/v1/human/inbox", get(routes::human_inbox))
        .route("/api/v1/human/outbox", get(routes::human_outbox))
        // Event stream
        .route("/api/v1/events", get(sse::events))
        // Attachments
        .route("/api/v1/files", post(files::upload))
        .route("/api/v1/files/{id}", get(files::fetch))
        .route("/api/v1/files/{id}/meta", get(files::meta))
        // Canvas layout passthrough (opaque to the core)
        .route("/api/v1/canvas", get(routes::canvas_get).put(routes::canvas_put))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
