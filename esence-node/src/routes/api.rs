//! The local UI API: state, pending review queue, approve/reject, peers,
//! context, patterns, and presence controls. Grounded on
//! `esence/interface/server.py`'s `/api/*` routes.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use esence_core::message::{CommonFields, Message, ThreadMessageBody};
use esence_core::peers::PeerManager;
use esence_core::store::Mood;
use serde::Deserialize;

use crate::node::Node;

pub async fn state(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    Json(node.state_snapshot())
}

pub async fn healthz(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    Json(node.health_snapshot())
}

pub async fn pending(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    let messages: Vec<_> = node
        .queue
        .peek_pending()
        .into_iter()
        .map(|m| serde_json::to_value(m).expect("Message always serializes"))
        .collect();
    Json(serde_json::json!({"messages": messages}))
}

#[derive(Deserialize, Default)]
pub struct ApproveBody {
    pub edited_reply: Option<String>,
}

pub async fn approve(
    State(node): State<Arc<Node>>,
    Path(thread_id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let edited_reply = body.and_then(|Json(b)| b.edited_reply);
    let message = node
        .queue
        .approve(&thread_id, edited_reply)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::to_value(message).expect("Message always serializes")))
}

pub async fn reject(
    State(node): State<Arc<Node>>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let message = node
        .queue
        .reject_pending(&thread_id)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::to_value(message).expect("Message always serializes")))
}

pub async fn list_peers(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let peers = PeerManager::new(&node.store)
        .get_all()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"peers": peers})))
}

#[derive(Deserialize)]
pub struct UpsertPeerBody {
    pub did: String,
    pub alias: Option<String>,
    pub blocked: Option<bool>,
}

pub async fn upsert_peer(
    State(node): State<Arc<Node>>,
    Json(body): Json<UpsertPeerBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let peers = PeerManager::new(&node.store);
    let record = peers
        .add_or_update(&body.did, |p| {
            if let Some(alias) = body.alias.clone() {
                p.alias = Some(alias);
            }
            if let Some(blocked) = body.blocked {
                p.blocked = blocked;
            }
        })
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(record).expect("PeerRecord always serializes")))
}

pub async fn delete_peer(
    State(node): State<Arc<Node>>,
    Path(did): Path<String>,
) -> Result<StatusCode, StatusCode> {
    PeerManager::new(&node.store)
        .remove(&did)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_threads(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let threads = node.store.list_threads().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"threads": threads})))
}

pub async fn get_thread(
    State(node): State<Arc<Node>>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let messages = node
        .store
        .read_thread(&thread_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"thread_id": thread_id, "messages": messages})))
}

pub async fn delete_thread(
    State(node): State<Arc<Node>>,
    Path(thread_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    node.store
        .delete_thread(&thread_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub to_did: String,
    pub content: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
}

/// Originate a new outbound message from the owner, bypassing the
/// inbound admission policy (the owner is always trusted to speak as
/// themselves). Persists the message to its thread and queues it for
/// the outbound loop to sign and send.
pub async fn send_message(
    State(node): State<Arc<Node>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let own_did = node.identity.read().expect("lock poisoned").did().to_string();
    let mut common = CommonFields::new(own_did, body.to_did, body.content);
    if let Some(thread_id) = body.thread_id {
        common.thread_id = thread_id;
    }
    let message = Message::ThreadMessage(ThreadMessageBody {
        common,
        subject: body.subject.unwrap_or_default(),
    });
    let thread_id = message.thread_id().to_string();

    let value = serde_json::to_value(&message).expect("Message always serializes");
    node.store
        .append_to_thread(&thread_id, value)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    node.queue
        .enqueue_outbound(message)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({"thread_id": thread_id, "status": "queued"})))
}

pub async fn get_context(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let content = node.store.read_context().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"context": content})))
}

#[derive(Deserialize)]
pub struct SetContextBody {
    pub content: String,
}

pub async fn set_context(
    State(node): State<Arc<Node>>,
    Json(body): Json<SetContextBody>,
) -> Result<StatusCode, StatusCode> {
    node.store
        .write_context(&body.content)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_patterns(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let patterns = node.store.read_patterns().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"patterns": patterns})))
}

pub async fn get_mood(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let mood = node.store.mood().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"mood": mood})))
}

#[derive(Deserialize)]
pub struct SetMoodBody {
    pub mood: Mood,
}

pub async fn set_mood(
    State(node): State<Arc<Node>>,
    Json(body): Json<SetMoodBody>,
) -> Result<StatusCode, StatusCode> {
    node.store.set_mood(body.mood).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_auto_approve(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let enabled = node.store.auto_approve().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({"auto_approve": enabled})))
}

#[derive(Deserialize)]
pub struct SetAutoApproveBody {
    pub enabled: bool,
}

pub async fn set_auto_approve(
    State(node): State<Arc<Node>>,
    Json(body): Json<SetAutoApproveBody>,
) -> Result<StatusCode, StatusCode> {
    node.store
        .set_auto_approve(body.enabled)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(StatusCode::NO_CONTENT)
}
