//! Entry point: parses configuration, loads or generates the node's
//! identity, wires the orchestrator, and serves the HTTP surface.
//! Mirrors the startup sequence of `esence/core/node.py::EsenceNode::start`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use esence_core::identity::Identity;
use esence_core::provider::{self, NullProvider, Provider};
use esence_core::store::Store;
use tracing::{info, warn};

use esence_node::config::Config;
use esence_node::node::Node;
use esence_node::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "esence_node=info".into()))
        .init();

    let config = Config::parse();
    for problem in config.validate() {
        warn!(%problem, "configuration issue");
    }

    info!(did = %config.did(), "starting esence node");

    let store_dir = PathBuf::from(&config.store_dir);
    let store = Arc::new(Store::new(store_dir.clone()));

    let identity = bootstrap_identity(&store, &config)?;

    let api_key = (!config.anthropic_api_key.is_empty()).then(|| config.anthropic_api_key.clone());
    let provider: Arc<dyn Provider> = match provider::by_name(&config.provider, api_key, &config.model) {
        Ok(provider) => Arc::from(provider),
        Err(e) => {
            warn!(error = %e, provider = %config.provider, "falling back to the null provider");
            Arc::new(NullProvider)
        }
    };

    let node = Node::new(config, identity, store, provider);
    node.reconcile_configured_host();
    node.autodiscover_tunnel().await;

    let router = routes::router(Arc::clone(&node));
    node.run(router).await
}

/// Load the identity from the store, or generate and persist a new one if
/// the store hasn't been bootstrapped yet. Also ensures the store's
/// ambient files (patterns, context, corrections, peers, budget, presence)
/// exist.
fn bootstrap_identity(store: &Store, config: &Config) -> anyhow::Result<Identity> {
    let private_key_path = store.root().join("keys").join("private.pem");
    if private_key_path.exists() {
        return Ok(Identity::load(store.root())?);
    }

    let identity = Identity::generate(&config.node_name, &config.effective_did_domain());
    let document = serde_json::to_value(identity.to_did_document())?;
    store.initialize(&document)?;
    identity.save(store.root())?;
    Ok(identity)
}
