// SPDX-License-Identifier: MIT
//! REST handlers. The gateway is the only place wire formats meet domain
//! types: handlers validate, call into the subsystems, and convert
//! [`HiveError`] into status codes. Unlike the router, gateway operations
//! raise errors to their caller synchronously.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::HiveError;
use crate::events::Event;
use crate::mail::model::{AttachmentRef, Mail, MailType, HUMAN_NODE};
use crate::swarm::model::{Bee, SwarmConfig};
use crate::topology::MergedEdge;
use crate::AppContext;

// ─── Error mapping ────────────────────────────────────────────────────────────

impl IntoResponse for HiveError {
    fn into_response(self) -> Response {
        let status = match &self {
            HiveError::NoRoute { .. } => StatusCode::FORBIDDEN,
            HiveError::UnknownNode(_) | HiveError::NotFound(_) => StatusCode::NOT_FOUND,
            HiveError::Validation(_) => StatusCode::BAD_REQUEST,
            HiveError::MailCorrupt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HiveError::ContainerRuntime(_) => StatusCode::BAD_GATEWAY,
            HiveError::AlreadyExists(_) | HiveError::Busy(_) => StatusCode::CONFLICT,
            HiveError::Io(_) | HiveError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "dataRoot": ctx.config.data_root.display().to_string(),
        "containerBackend": ctx.config.container_backend,
    }))
}

// ─── Swarm configuration ──────────────────────────────────────────────────────

pub async fn swarm_get(State(ctx): State<Arc<AppContext>>) -> Json<SwarmConfig> {
    Json((*ctx.registry.snapshot()).clone())
}

pub async fn swarm_put(
    State(ctx): State<Arc<AppContext>>,
    Json(cfg): Json<SwarmConfig>,
) -> Result<Json<SwarmConfig>, HiveError> {
    let snapshot = ctx.registry.put(cfg).await?;
    ctx.apply_topology().await;
    Ok(Json((*snapshot).clone()))
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn node_list(State(ctx): State<Arc<AppContext>>) -> Json<Vec<NodeInfo>> {
    let nodes = ctx
        .supervisor
        .list()
        .await
        .into_iter()
        .map(|(bee, state)| NodeInfo {
            id: bee.id,
            name: bee.name,
            model: bee.model,
            running: state.running,
            container_id: state.container_id,
            started_at: state.started_at,
        })
        .collect();
    Json(nodes)
}

pub async fn node_add(
    State(ctx): State<Arc<AppContext>>,
    Json(bee): Json<Bee>,
) -> Result<(StatusCode, Json<Bee>), HiveError> {
    ctx.registry
        .add_bee(bee.clone(), ctx.config.auto_connect_human)
        .await?;
    ctx.store.ensure_agent_dirs(&bee.id).await?;
    ctx.apply_topology().await;
    Ok((StatusCode::CREATED, Json(bee)))
}

pub async fn node_remove(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, HiveError> {
    if ctx.registry.snapshot().bee(&id).is_none() {
        return Err(HiveError::NotFound(id));
    }
    // Stop first; a bee that was never started has nothing to stop.
    if let Err(e) = ctx.supervisor.stop_agent(&id).await {
        warn!(agent = %id, err = %e, "stop before removal failed");
    }
    ctx.registry.remove_bee(&id).await?;
    ctx.supervisor.remove_agent(&id).await?;
    ctx.apply_topology().await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn node_start(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<crate::runtime::supervisor::AgentState>, HiveError> {
    Ok(Json(ctx.supervisor.start_agent(&id).await?))
}

pub async fn node_stop(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<crate::runtime::supervisor::AgentState>, HiveError> {
    Ok(Json(ctx.supervisor.stop_agent(&id).await?))
}

pub async fn node_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<crate::runtime::supervisor::AgentState>, HiveError> {
    Ok(Json(ctx.supervisor.status(&id).await?))
}

pub async fn node_hierarchy(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<crate::runtime::supervisor::HierarchyFile>, HiveError> {
    let cfg = ctx.registry.snapshot();
    Ok(Json(ctx.supervisor.hierarchy(&cfg, &id)?))
}

#[derive(Deserialize)]
pub struct TranscriptQuery {
    #[serde(default = "default_transcript_lines")]
    pub lines: usize,
}

fn default_transcript_lines() -> usize {
    100
}

pub async fn node_transcript(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Json<Value>, HiveError> {
    if ctx.registry.snapshot().bee(&id).is_none() {
        return Err(HiveError::UnknownNode(id));
    }
    let path = ctx.store.agent_logs_dir(&id).join("agent.log");
    let lines: Vec<String> = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(query.lines);
            all[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(serde_json::json!({ "agentId": id, "lines": lines })))
}

pub async fn node_inbox(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Mail>>, HiveError> {
    enumerate_queue(&ctx, &id, true).await
}

pub async fn node_outbox(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Mail>>, HiveError> {
    enumerate_queue(&ctx, &id, false).await
}

async fn enumerate_queue(
    ctx: &AppContext,
    node: &str,
    inbox: bool,
) -> Result<Json<Vec<Mail>>, HiveError> {
    if !ctx.registry.snapshot().node_exists(node) || node == HUMAN_NODE {
        return Err(HiveError::UnknownNode(node.to_string()));
    }
    let dir = match (inbox, crate::mail::model::mailbox_name(node)) {
        (true, Some(name)) => ctx.store.mailbox_inbox(name),
        (false, Some(name)) => ctx.store.mailbox_outbox(name),
        (true, None) => ctx.store.agent_inbox(node),
        (false, None) => ctx.store.agent_outbox(node),
    };
    let mut mails = Vec::new();
    for path in ctx.store.list_mail_files(&dir).await? {
        match ctx.store.read_mail(&path).await {
            Ok(mail) => mails.push(mail),
            Err(e) => warn!(path = %path.display(), err = %e, "skipping unreadable queue file"),
        }
    }
    Ok(Json(mails))
}

// ─── Connections ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBody {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
}

pub async fn conn_list(State(ctx): State<Arc<AppContext>>) -> Json<Vec<MergedEdge>> {
    Json(ctx.topology.snapshot().merge())
}

/// Read-only diagnostic; cycles are permitted, never rejected.
pub async fn conn_cycles(State(ctx): State<Arc<AppContext>>) -> Json<Vec<Vec<String>>> {
    Json(ctx.topology.snapshot().detect_cycles())
}

pub async fn conn_add(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<Vec<MergedEdge>>, HiveError> {
    ctx.registry
        .add_connection(&body.from, &body.to, body.bidirectional)
        .await?;
    ctx.apply_topology().await;
    Ok(Json(ctx.topology.snapshot().merge()))
}

pub async fn conn_remove(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<Vec<MergedEdge>>, HiveError> {
    ctx.registry
        .remove_connection(&body.from, &body.to, body.bidirectional)
        .await?;
    ctx.apply_topology().await;
    Ok(Json(ctx.topology.snapshot().merge()))
}

pub async fn conn_set_bidirectional(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<Vec<MergedEdge>>, HiveError> {
    ctx.registry
        .set_bidirectional(&body.from, &body.to, body.bidirectional)
        .await?;
    ctx.apply_topology().await;
    Ok(Json(ctx.topology.snapshot().merge()))
}

// ─── Mail ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMailBody {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

/// mail.send — write to the human outbox and route. Fails with `ErrNoRoute`
/// when the topology has no `human → to` edge.
pub async fn mail_send(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SendMailBody>,
) -> Result<(StatusCode, Json<Mail>), HiveError> {
    if !ctx.router.can_route(HUMAN_NODE, &body.to) {
        return Err(HiveError::NoRoute {
            from: HUMAN_NODE.to_string(),
            to: body.to,
        });
    }

    let mut mail = Mail::new(HUMAN_NODE, body.to, body.subject, body.body, MailType::Human);
    mail.attachments = body.attachments;

    ctx.bus.publish(Event::MailSent(mail.clone()));
    let outcome = ctx.router.submit(mail.clone()).await;

    // Archive the send in the human outbox with its terminal status.
    let mut archived = mail;
    archived.status = outcome.status();
    ctx.human.append_outbox(archived.clone()).await?;
    ctx.counter.touch().await;

    Ok((StatusCode::ACCEPTED, Json(archived)))
}

pub async fn human_inbox(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<Mail>>, HiveError> {
    Ok(Json(ctx.human.inbox().await?))
}

pub async fn human_outbox(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<Mail>>, HiveError> {
    Ok(Json(ctx.human.outbox().await?))
}

pub async fn mail_counts(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(serde_json::to_value(ctx.counter.snapshot().await).unwrap_or_default())
}

// ─── Canvas passthrough ───────────────────────────────────────────────────────

pub async fn canvas_get(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, HiveError> {
    match tokio::fs::read(ctx.store.canvas_path()).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Json)
            .map_err(|e| HiveError::Validation(format!("canvas layout unreadable: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Json(serde_json::json!({}))),
        Err(e) => Err(e.into()),
    }
}

pub async fn canvas_put(
    State(ctx): State<Arc<AppContext>>,
    Json(layout): Json<Value>,
) -> Result<StatusCode, HiveError> {
    let path = ctx.store.canvas_path();
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(&layout)
        .map_err(|e| HiveError::Validation(format!("encode canvas layout: {e}")))?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}
