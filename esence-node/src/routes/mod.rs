//! axum route wiring. Grounded on `esence/interface/server.py`'s route
//! table and on the teacher's `freeq-server/src/bin/credential-issuer.rs`
//! for the DID-document-serving shape.

mod anp;
mod api;
mod did;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::node::Node;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/anp/message", post(anp::receive_message))
        .route("/.well-known/did.json", get(did::did_document))
        .route("/api/state", get(api::state))
        .route("/api/pending", get(api::pending))
        .route("/api/approve/{thread_id}", post(api::approve))
        .route("/api/reject/{thread_id}", post(api::reject))
        .route("/api/peers", get(api::list_peers).post(api::upsert_peer))
        .route("/api/peers/{did}", axum::routing::delete(api::delete_peer))
        .route("/api/threads", get(api::list_threads))
        .route("/api/threads/{thread_id}", get(api::get_thread).delete(api::delete_thread))
        .route("/api/context", get(api::get_context).put(api::set_context))
        .route("/api/patterns", get(api::list_patterns))
        .route("/api/mood", get(api::get_mood).post(api::set_mood))
        .route("/api/auto-approve", get(api::get_auto_approve).post(api::set_auto_approve))
        .route("/api/send", post(api::send_message))
        .route("/healthz", get(api::healthz))
        .layer(CorsLayer::permissive())
        .with_state(node)
}
