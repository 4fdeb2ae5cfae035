//! HTTP API for a registry node
//!
//! - Join/leave groups, read membership from the fast lookup
//! - Publish to channels, stream a member's inbox over SSE
//! - Health and rebalance endpoints

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{HashRing, MemberId};
use crate::coordinator::request::Outcome;
use crate::coordinator::supervisor::Supervisor;
use crate::coordinator::transport::LocalCluster;
use crate::vnode::FastLookup;
use async_stream::stream;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct RegistryState {
    pub node_id: String,
    pub ring: Arc<HashRing>,
    pub cluster: Arc<LocalCluster>,
    pub supervisor: Arc<Supervisor>,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub member: String,
}

pub fn create_router(state: RegistryState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/groups/:group/members", post(join_group))
        .route("/groups/:group/members", get(list_members))
        .route("/groups/:group/members/:member", delete(leave_group))
        .route("/channels/:channel/publish", post(publish))
        .route("/inbox/:member", get(inbox_sse))
        .route("/admin/rebalance", post(admin_rebalance))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_tracing_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .with_state(state)
}

fn error_response(e: crate::Error) -> Response {
    (
        e.to_http_status(),
        Json(json!({ "error": e.to_string(), "retryable": e.is_retryable() })),
    )
        .into_response()
}

async fn health(State(state): State<RegistryState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "node_id": state.node_id,
        "version": crate::VERSION,
        "in_flight": state.supervisor.in_flight(),
        "live_nodes": state.ring.live_nodes(),
        "vnodes": state.cluster.running().len(),
        "timestamp": crate::common::timestamp_now(),
    }))
}

async fn join_group(
    State(state): State<RegistryState>,
    Path(group): Path<String>,
    Json(body): Json<JoinRequest>,
) -> Response {
    if body.member.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "member must not be empty" })),
        )
            .into_response();
    }

    let mut pending = state.supervisor.join(group, MemberId::from(body.member));
    let request_id = pending.request_id();
    match pending.wait().await {
        Ok(Outcome::Members(members)) => Json(json!({
            "request_id": request_id,
            "members": members,
        }))
        .into_response(),
        Ok(other) => error_response(crate::Error::Internal(format!(
            "unexpected outcome {:?}",
            other
        ))),
        Err(e) => error_response(e),
    }
}

async fn leave_group(
    State(state): State<RegistryState>,
    Path((group, member)): Path<(String, String)>,
) -> Response {
    let mut pending = state.supervisor.leave(group, MemberId::from(member));
    let request_id = pending.request_id();
    match pending.wait().await {
        Ok(Outcome::Members(members)) => Json(json!({
            "request_id": request_id,
            "members": members,
        }))
        .into_response(),
        Ok(other) => error_response(crate::Error::Internal(format!(
            "unexpected outcome {:?}",
            other
        ))),
        Err(e) => error_response(e),
    }
}

/// Non-authoritative read from the fast lookup
async fn list_members(
    State(state): State<RegistryState>,
    Path(group): Path<String>,
) -> impl IntoResponse {
    let members = state.cluster.lookup().read(&group);
    Json(json!({ "group": group, "members": members }))
}

async fn publish(
    State(state): State<RegistryState>,
    Path(channel): Path<String>,
    body: Bytes,
) -> Response {
    let mut pending = state.supervisor.publish(channel, body);
    let request_id = pending.request_id();
    match pending.wait().await {
        Ok(Outcome::Published(notified)) => Json(json!({
            "request_id": request_id,
            "notified": notified,
        }))
        .into_response(),
        Ok(other) => error_response(crate::Error::Internal(format!(
            "unexpected outcome {:?}",
            other
        ))),
        Err(e) => error_response(e),
    }
}

/// SSE stream of messages delivered to `member` on this node
async fn inbox_sse(
    State(state): State<RegistryState>,
    Path(member): Path<String>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.cluster.mailboxes().subscribe(&MemberId::from(member));
    let stream = stream! {
        while let Some(message) = rx.recv().await {
            let data = String::from_utf8_lossy(&message).into_owned();
            yield Ok(Event::default().data(data));
        }
    };
    Sse::new(stream)
}

async fn admin_rebalance(State(state): State<RegistryState>) -> impl IntoResponse {
    let report = crate::ops::rebalance(&state.cluster, &state.ring).await;
    Json(json!({ "status": "ok", "report": report }))
}
