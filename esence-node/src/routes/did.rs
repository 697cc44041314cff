use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use crate::node::Node;

pub async fn did_document(State(node): State<Arc<Node>>) -> Result<Json<serde_json::Value>, StatusCode> {
    let identity = node.identity.read().expect("lock poisoned");
    let document = identity.to_did_document();
    Ok(Json(serde_json::to_value(document).expect("document serializes")))
}
