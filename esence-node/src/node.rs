//! The node orchestrator: wires the store, identity, queue, transport and
//! provider together and drives the four long-lived tasks. Grounded on
//! `esence/core/node.py::EsenceNode`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use esence_core::identity::Identity;
use esence_core::message::{Message, MessageStatus, PeerIntroBody};
use esence_core::patterns::extract_patterns;
use esence_core::peers::PeerManager;
use esence_core::provider::{HistoryTurn, Provider, Role};
use esence_core::queue::{Queue, QueueEvent};
use esence_core::store::Store;
use esence_core::transport::Transport;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::tunnel;

const GOSSIP_INTERVAL: Duration = Duration::from_secs(300);
const GOSSIP_TRUST_THRESHOLD: f64 = 0.4;
const SYSTEM_PROMPT: &str =
    "You are an agent speaking on behalf of your owner to another node's agent. Be concise and direct.";
const REPLY_MAX_TOKENS: u32 = 512;
const HISTORY_WINDOW: usize = 10;
const BUDGET_EXCEEDED_REPLY: &str =
    "I've used up my conversation budget for this month, so I can't generate a reply right now. My owner will follow up.";

pub struct Node {
    pub config: Config,
    pub identity: std::sync::RwLock<Identity>,
    pub store: Arc<Store>,
    pub queue: Arc<Queue>,
    pub transport: Arc<Transport>,
    pub provider: Arc<dyn Provider>,
    pub rate_limiter: Arc<RateLimiter>,
    running: AtomicBool,
}

impl Node {
    pub fn new(config: Config, identity: Identity, store: Arc<Store>, provider: Arc<dyn Provider>) -> Arc<Self> {
        let queue = Arc::new(Queue::new(Arc::clone(&store)));
        Arc::new(Self {
            config,
            identity: std::sync::RwLock::new(identity),
            store,
            queue,
            transport: Arc::new(Transport::new()),
            provider,
            rate_limiter: Arc::new(RateLimiter::new()),
            running: AtomicBool::new(true),
        })
    }

    /// A snapshot of node health for the local UI API, matching
    /// `esence/core/node.py::get_state`.
    pub fn state_snapshot(&self) -> serde_json::Value {
        let identity = self.identity.read().expect("lock poisoned");
        let peers = PeerManager::new(&self.store);
        let budget = self.store.read_budget().unwrap_or_default();
        let maturity = esence_core::maturity::calculate_maturity(&self.store).unwrap_or(0.0);
        serde_json::json!({
            "status": "online",
            "did": identity.did(),
            "node_name": self.config.node_name,
            "domain": self.config.effective_domain(),
            "public_url": self.config.public_url,
            "peer_count": peers.peer_count().unwrap_or(0),
            "pending_count": self.queue.pending_count(),
            "mood": self.store.mood().unwrap_or_default(),
            "budget": {
                "used_tokens": budget.used_tokens,
                "monthly_limit_tokens": budget.monthly_limit_tokens,
                "calls_total": budget.calls_total,
            },
            "maturity": maturity,
            "maturity_label": esence_core::maturity::maturity_label(maturity),
            "corrections_count": self.store.read_corrections().map(|c| c.len()).unwrap_or(0),
            "patterns_count": self.store.read_patterns().map(|p| p.len()).unwrap_or(0),
        })
    }

    /// Health snapshot for `GET /healthz`: identifier, counts, maturity,
    /// budget, crate version, public URL, and the most recent peer
    /// interaction, per §6's health contract.
    pub fn health_snapshot(&self) -> serde_json::Value {
        let identity = self.identity.read().expect("lock poisoned");
        let peers = PeerManager::new(&self.store).get_all().unwrap_or_default();
        let last_peer_activity = peers.iter().filter_map(|p| p.last_seen).max();
        let maturity = esence_core::maturity::calculate_maturity(&self.store).unwrap_or(0.0);
        let budget = self.store.read_budget().unwrap_or_default();
        serde_json::json!({
            "status": "ok",
            "did": identity.did(),
            "version": env!("CARGO_PKG_VERSION"),
            "public_url": self.config.public_url,
            "peer_count": peers.len(),
            "pending_count": self.queue.pending_count(),
            "maturity": maturity,
            "maturity_label": esence_core::maturity::maturity_label(maturity),
            "budget": {
                "used_tokens": budget.used_tokens,
                "monthly_limit_tokens": budget.monthly_limit_tokens,
                "calls_total": budget.calls_total,
            },
            "last_peer_activity": last_peer_activity,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Restore any messages left pending review across a restart, then
    /// spawn the four long-lived tasks and wait on them.
    pub async fn run(self: Arc<Self>, router: axum::Router) -> anyhow::Result<()> {
        match self.queue.restore_pending() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "restored pending reviews from disk"),
            Err(e) => error!(error = %e, "failed to restore pending reviews"),
        }

        if !self.config.bootstrap_peer.is_empty() {
            let node = Arc::clone(&self);
            let peer_did = self.config.bootstrap_peer.clone();
            tokio::spawn(async move { node.bootstrap_peer(&peer_did).await });
        }

        tokio::spawn(Arc::clone(&self).watch_correction_checkpoints());

        let http = {
            let addr = format!("0.0.0.0:{}", self.config.port);
            tokio::spawn(async move {
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
                )
                .await?;
                Ok::<_, std::io::Error>(())
            })
        };
        let inbound = tokio::spawn(Arc::clone(&self).process_inbound_loop());
        let outbound = tokio::spawn(Arc::clone(&self).process_outbound_loop());
        let gossip = tokio::spawn(Arc::clone(&self).gossip_loop());

        let _ = tokio::join!(http, inbound, outbound, gossip);
        Ok(())
    }

    /// Dequeue inbound messages and spawn a detached handler per message,
    /// so one slow or failing handler never blocks later items.
    async fn process_inbound_loop(self: Arc<Self>) {
        let Some(mut rx) = self.queue.take_inbound_receiver() else {
            error!("inbound receiver already taken");
            return;
        };
        while self.is_running() {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(message)) => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.handle_inbound(message).await });
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, message: Message) {
        let from_did = message.from_did().to_string();
        let thread_id = message.thread_id().to_string();
        let peers = PeerManager::new(&self.store);

        if let Message::PeerIntro(PeerIntroBody { known_peers, .. }) = &message {
            if let Err(e) = peers.merge_gossip(known_peers, &from_did) {
                error!(error = %e, %from_did, "failed to merge gossip");
            }
            let _ = peers.record_interaction(&from_did, true);
            return;
        }

        let _ = peers.record_interaction(&from_did, true);
        self.queue.notify(QueueEvent::AgentThinking {
            thread_id: thread_id.clone(),
        });

        let history = self.compose_history(&thread_id, &message.common().content);

        let over_budget = self.store.is_over_budget().unwrap_or(false);
        let completion_text = if over_budget {
            BUDGET_EXCEEDED_REPLY.to_string()
        } else {
            match self.provider.complete(SYSTEM_PROMPT, &history, REPLY_MAX_TOKENS).await {
                Ok(completion) => {
                    if let Err(e) = self.store.record_usage(completion.total_tokens() as u64) {
                        warn!(error = %e, "failed to record token usage");
                    }
                    completion.text
                }
                Err(e) => {
                    error!(error = %e, %thread_id, "provider completion failed");
                    return;
                }
            }
        };

        if let Err(e) = self.queue.set_proposed_reply(&thread_id, completion_text) {
            error!(error = %e, %thread_id, "failed to persist proposed reply");
            return;
        }

        if message.status() == MessageStatus::AutoApproved {
            match self.queue.approve(&thread_id, None) {
                Ok(_) => self.queue.notify(QueueEvent::AutoApproved { thread_id }),
                Err(e) => error!(error = %e, "auto-approve failed"),
            }
        } else {
            self.queue.notify(QueueEvent::ReviewReady { thread_id });
        }
    }

    /// Read up to the last 10 entries of a thread and map each one's
    /// `from_did` to a provider role: our own current identifier is
    /// `assistant`, everything else is `user`. Threads written before an
    /// `update_host` replay under the old identifier as `user` — that's
    /// intentional, not a bug (see DESIGN.md).
    fn compose_history(&self, thread_id: &str, new_content: &str) -> Vec<HistoryTurn> {
        let own_did = self.identity.read().expect("lock poisoned").did().to_string();
        let thread = self.store.read_thread(thread_id).unwrap_or_default();
        // The current inbound message is already the thread's last entry
        // (admission persists before the handler runs); exclude it here
        // since it's appended below as the new turn instead.
        let historical = &thread[..thread.len().saturating_sub(1)];
        let start = historical.len().saturating_sub(HISTORY_WINDOW);
        let mut history: Vec<HistoryTurn> = historical[start..]
            .iter()
            .filter_map(|entry| {
                let from_did = entry.get("from_did")?.as_str()?;
                let content = entry.get("content")?.as_str()?.to_string();
                let role = if from_did == own_did { Role::Assistant } else { Role::User };
                Some(HistoryTurn { role, content })
            })
            .collect();
        history.push(HistoryTurn {
            role: Role::User,
            content: new_content.to_string(),
        });
        history
    }

    async fn process_outbound_loop(self: Arc<Self>) {
        let Some(mut rx) = self.queue.take_outbound_receiver() else {
            error!("outbound receiver already taken");
            return;
        };
        while self.is_running() {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(message)) => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.send_outbound(message).await });
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    async fn send_outbound(self: Arc<Self>, message: Message) {
        let to_did = message.to_did().to_string();
        let thread_id = message.thread_id().to_string();
        let identity = self.identity.read().expect("lock poisoned").clone();
        let sent = self.transport.send_message(&message, &identity).await;

        let status = if sent {
            MessageStatus::Sent
        } else {
            MessageStatus::PendingHumanReview
        };
        let mut rewritten = message;
        rewritten.set_status(status);
        if let Ok(mut thread) = self.store.read_thread(&thread_id) {
            if let Some(last) = thread.last_mut() {
                *last = serde_json::to_value(&rewritten).expect("Message always serializes");
            }
            let _ = self.store.write_thread(&thread_id, &thread);
        }

        if sent {
            let peers = PeerManager::new(&self.store);
            let _ = peers.record_interaction(&to_did, true);
        } else {
            warn!(%to_did, %thread_id, "outbound send failed");
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        while self.is_running() {
            tokio::time::sleep(GOSSIP_INTERVAL).await;
            if let Err(e) = self.send_gossip().await {
                error!(error = %e, "gossip round failed");
            }
        }
    }

    async fn send_gossip(&self) -> anyhow::Result<()> {
        let peers = PeerManager::new(&self.store);
        let trusted = peers.trusted_peers(GOSSIP_TRUST_THRESHOLD)?;
        if trusted.is_empty() {
            return Ok(());
        }
        let known_peers = peers.gossip_payload()?;
        let identity = self.identity.read().expect("lock poisoned").clone();

        for peer in trusted {
            let intro = Message::PeerIntro(PeerIntroBody {
                common: esence_core::message::CommonFields::new(identity.did(), peer.did.clone(), ""),
                public_key: identity.public_key_b64(),
                known_peers: known_peers.clone(),
            });
            if !self.transport.send_message(&intro, &identity).await {
                warn!(peer = %peer.did, "gossip send failed");
            }
        }
        Ok(())
    }

    async fn bootstrap_peer(&self, peer_did: &str) {
        let peers = PeerManager::new(&self.store);
        if let Err(e) = peers.add_or_update(peer_did, |p| p.trust_score = 0.3) {
            error!(error = %e, "failed to register bootstrap peer");
            return;
        }
        let identity = self.identity.read().expect("lock poisoned").clone();
        let intro = Message::PeerIntro(PeerIntroBody {
            common: esence_core::message::CommonFields::new(identity.did(), peer_did, ""),
            public_key: identity.public_key_b64(),
            known_peers: peers.gossip_payload().unwrap_or_default(),
        });
        if self.transport.send_message(&intro, &identity).await {
            info!(peer = %peer_did, "bootstrap peer intro sent");
        } else {
            warn!(peer = %peer_did, "bootstrap peer intro failed");
        }
    }

    /// Subscribe to queue events and trigger pattern extraction on every
    /// fifth correction, mirroring `EsenceNode::_on_queue_event`.
    async fn watch_correction_checkpoints(self: Arc<Self>) {
        let mut events = self.queue.subscribe();
        loop {
            match events.recv().await {
                Ok(QueueEvent::CorrectionLogged { count, .. }) if Queue::is_pattern_extraction_checkpoint(count) => {
                    self.run_pattern_extraction().await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Run pattern extraction and, if anything new was found, notify
    /// subscribers. Triggered by the queue every fifth correction.
    pub async fn run_pattern_extraction(&self) {
        match extract_patterns(&self.store, self.provider.as_ref(), None).await {
            Ok(0) => {}
            Ok(added) => self.queue.notify(QueueEvent::PatternsUpdated { added }),
            Err(e) => error!(error = %e, "pattern extraction failed"),
        }
    }

    /// Reconcile a loaded identifier against the currently-effective host.
    /// A store persisted under one domain/port and restarted under another
    /// (e.g. `ESENCE_DOMAIN` or `ESENCE_PORT` changed) must re-derive its
    /// identifier rather than keep serving a now-unreachable one, per the
    /// identity invariant in §4.2.
    pub fn reconcile_configured_host(&self) {
        let configured_host = self.config.effective_did_domain();
        let mut identity = self.identity.write().expect("lock poisoned");
        let current_host = identity.did().splitn(4, ':').nth(2).unwrap_or("");
        if current_host != configured_host {
            info!(from = %current_host, to = %configured_host, "reconciling identifier host");
            if let Err(e) = identity.update_host(&configured_host, self.store.root()) {
                error!(error = %e, "failed to reconcile identifier host");
            }
        }
    }

    /// Resolve `public_url` via tunnel discovery if not already configured,
    /// re-deriving the identifier and rewriting the published document.
    pub async fn autodiscover_tunnel(&self) {
        if !self.config.public_url.is_empty() {
            return;
        }
        if let Some(url) = tunnel::discover(self.config.port).await {
            info!(%url, "discovered public tunnel");
            let host = url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .to_string();
            let mut identity = self.identity.write().expect("lock poisoned");
            if let Err(e) = identity.update_host(&host, self.store.root()) {
                error!(error = %e, "failed to update identity host after tunnel discovery");
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use esence_core::message::{CommonFields, ThreadMessageBody};
    use esence_core::provider::{Completion, NullProvider, ProviderError};
    use esence_core::queue::AdmissionDecision;
    use esence_core::store::Mood;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::tempdir;

    fn test_config(store_dir: &std::path::Path) -> Config {
        Config {
            provider: "null".into(),
            anthropic_api_key: "".into(),
            model: "claude-sonnet-4-5".into(),
            node_name: "node0".into(),
            domain: "localhost".into(),
            donation_pct: 10,
            port: 7777,
            bootstrap_peer: "".into(),
            public_url: "".into(),
            dev_skip_sig: true,
            store_dir: store_dir.display().to_string(),
        }
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for CountingProvider {
        async fn complete(
            &self,
            _system: &str,
            history: &[HistoryTurn],
            _max_tokens: u32,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Completion {
                text: history.last().map(|t| t.content.clone()).unwrap_or_default(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn test_node(provider: Arc<dyn Provider>) -> (tempfile::TempDir, Arc<Node>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        let identity = Identity::generate("node0", "localhost%3A7777");
        let document = serde_json::to_value(identity.to_did_document()).unwrap();
        store.initialize(&document).unwrap();
        identity.save(dir.path()).unwrap();
        let config = test_config(dir.path());
        let node = Node::new(config, identity, store, provider);
        (dir, node)
    }

    fn sample_message() -> Message {
        Message::ThreadMessage(ThreadMessageBody {
            common: CommonFields::new("did:wba:other:bob", "did:wba:localhost%3A7777:node0", "Hola"),
            subject: "greeting".into(),
        })
    }

    #[tokio::test]
    async fn pending_review_message_emits_agent_thinking_then_review_ready() {
        let (_dir, node) = test_node(Arc::new(NullProvider));
        node.store.set_mood(Mood::Moderate).unwrap();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();

        let mut events = node.queue.subscribe();
        let decision = node.queue.enqueue_inbound(message.clone()).unwrap();
        assert_eq!(decision, AdmissionDecision::PendingHumanReview);

        Arc::clone(&node).handle_inbound(message).await;

        let pending = node.queue.get_pending_message(&thread_id).unwrap();
        assert_eq!(pending.common().content, "Hola");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], QueueEvent::InboundMessage { .. }));
        assert!(matches!(seen[1], QueueEvent::AgentThinking { .. }));
        assert!(matches!(seen[2], QueueEvent::ReviewReady { .. }));
    }

    #[tokio::test]
    async fn over_budget_skips_provider_and_uses_sentinel_reply() {
        let counting = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let (_dir, node) = test_node(counting.clone());
        node.store.set_auto_approve(true).unwrap();

        let mut budget = node.store.read_budget().unwrap();
        budget.used_tokens = budget.monthly_limit_tokens;
        node.store.write_budget(&budget).unwrap();

        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        node.queue.enqueue_inbound(message.clone()).unwrap();
        Arc::clone(&node).handle_inbound(message).await;

        assert_eq!(counting.calls.load(AtomicOrdering::SeqCst), 0);
        let thread = node.store.read_thread(&thread_id).unwrap();
        let last = thread.last().unwrap();
        assert_eq!(last["content"], BUDGET_EXCEEDED_REPLY);
        assert_eq!(last["status"], "approved");
    }

    #[test]
    fn reconcile_host_rewrites_identifier_on_domain_change() {
        let (_dir, node) = test_node(Arc::new(NullProvider));
        // Simulate a restart with a changed `ESENCE_DOMAIN`: a fresh `Node`
        // sharing the same on-disk identity and store, but a config that no
        // longer matches the identifier's host.
        let mut config = node.config.clone();
        config.domain = "example.com".into();
        let identity = Identity::load(node.store.root()).unwrap();
        let reloaded = Node::new(config, identity, Arc::clone(&node.store), Arc::new(NullProvider));

        reloaded.reconcile_configured_host();
        assert_eq!(reloaded.identity.read().unwrap().did(), "did:wba:example.com:node0");
    }
}
