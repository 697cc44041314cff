//! The inbound message endpoint, grounded on
//! `esence/interface/server.py`'s `POST /anp/message` handler.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use esence_core::message::MessageError;
use serde_json::Value;
use tracing::warn;

use crate::node::Node;

pub async fn receive_message(
    State(node): State<Arc<Node>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !node.rate_limiter.check(normalize(addr.ip())) {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let (message, valid) = node.transport.receive_message(payload).await.map_err(|e| match e {
        MessageError::IdentifierInvalid(_) => StatusCode::UNAUTHORIZED,
        MessageError::Malformed(_) => StatusCode::BAD_REQUEST,
    })?;

    if !valid && !node.config.dev_skip_sig {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if !valid {
        warn!(from_did = message.from_did(), "[DEV] accepting unverified message, signature skipped");
    }

    let thread_id = message.thread_id().to_string();
    node.queue.enqueue_inbound(message).map_err(|e| {
        warn!(error = %e, "failed to enqueue inbound message");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({"status": "received", "thread_id": thread_id})))
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
    }
}
