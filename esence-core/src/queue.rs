//! Inbound admission, routing, persistence, review, and outbound dispatch —
//! the message lifecycle engine. Grounded on `esence/core/queue.py`; the
//! admission rule order below is load-bearing and must not be reordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::maturity::calculate_maturity;
use crate::message::{Message, MessageStatus};
use crate::peers::PeerManager;
use crate::store::{Correction, Mood, Store, StoreError};

const AVAILABLE_MIN_TRUST: f64 = 0.3;
const MODERATE_MIN_TRUST: f64 = 0.5;
const DEFAULT_AUTONOMY_THRESHOLD: f64 = 0.6;
const PATTERN_EXTRACTION_EVERY: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no pending message for thread {0}")]
    NotPending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    AutoApproved,
    PendingHumanReview,
    Rejected,
}

impl From<AdmissionDecision> for MessageStatus {
    fn from(decision: AdmissionDecision) -> Self {
        match decision {
            AdmissionDecision::AutoApproved => MessageStatus::AutoApproved,
            AdmissionDecision::PendingHumanReview => MessageStatus::PendingHumanReview,
            AdmissionDecision::Rejected => MessageStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    InboundMessage { thread_id: String },
    Rejected { thread_id: String, reason: String },
    AutoApproved { thread_id: String },
    AgentThinking { thread_id: String },
    ReviewReady { thread_id: String },
    CorrectionLogged { thread_id: String, count: usize },
    PatternsUpdated { added: usize },
}

/// The message lifecycle engine: admission, persistence, pending review,
/// and the inbound/outbound channels the orchestrator drains.
pub struct Queue {
    store: Arc<Store>,
    pending: Mutex<HashMap<String, Message>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Queue {
    pub fn new(store: Arc<Store>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Take the inbound receiver. Callable once; the orchestrator's inbound
    /// loop owns it for the node's lifetime.
    pub fn take_inbound_receiver(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbound_rx.lock().expect("lock poisoned").take()
    }

    pub fn take_outbound_receiver(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.outbound_rx.lock().expect("lock poisoned").take()
    }

    fn persist(&self, message: &Message) -> Result<(), QueueError> {
        let value = serde_json::to_value(message).expect("Message always serializes");
        self.store.append_to_thread(message.thread_id(), value)?;
        Ok(())
    }

    fn rewrite_last(&self, message: &Message) -> Result<(), QueueError> {
        let mut thread = self.store.read_thread(message.thread_id())?;
        let value = serde_json::to_value(message).expect("Message always serializes");
        if thread.is_empty() {
            thread.push(value);
        } else {
            let last = thread.len() - 1;
            thread[last] = value;
        }
        self.store.write_thread(message.thread_id(), &thread)?;
        Ok(())
    }

    /// Apply the admission rule order, persist, and (unless rejected) queue
    /// the message for handling. Returns the decision reached.
    pub fn enqueue_inbound(&self, mut message: Message) -> Result<AdmissionDecision, QueueError> {
        let peers = PeerManager::new(&self.store);
        let from_did = message.from_did().to_string();

        if peers.is_blocked(&from_did)? {
            return self.reject(message, "peer is blocked");
        }

        let mood = self.store.mood()?;
        if mood == Mood::Dnd {
            return self.reject(message, "owner is unavailable");
        }

        let decision = if self.store.auto_approve()? {
            AdmissionDecision::AutoApproved
        } else {
            let peer_trust = peers.get_peer(&from_did)?.map(|p| p.trust_score).unwrap_or(0.0);
            match mood {
                Mood::Available if peer_trust >= AVAILABLE_MIN_TRUST => AdmissionDecision::AutoApproved,
                Mood::Moderate => {
                    let maturity = calculate_maturity(&self.store)?;
                    if maturity >= DEFAULT_AUTONOMY_THRESHOLD && peer_trust >= MODERATE_MIN_TRUST {
                        AdmissionDecision::AutoApproved
                    } else {
                        AdmissionDecision::PendingHumanReview
                    }
                }
                _ => AdmissionDecision::PendingHumanReview,
            }
        };

        message.set_status(decision.into());
        let thread_id = message.thread_id().to_string();

        // peer_intro is control-plane gossip traffic, not a conversational
        // message: it is handed to the inbound loop for merging but never
        // persisted to a thread or held in the pending-review map.
        if !matches!(message, Message::PeerIntro(_)) {
            self.persist(&message)?;
            self.pending
                .lock()
                .expect("lock poisoned")
                .insert(thread_id.clone(), message.clone());
        }
        self.inbound_tx.send(message).ok();
        self.emit(QueueEvent::InboundMessage { thread_id });
        Ok(decision)
    }

    fn reject(&self, mut message: Message, reason: &str) -> Result<AdmissionDecision, QueueError> {
        message.set_status(MessageStatus::Rejected);
        self.persist(&message)?;
        self.emit(QueueEvent::Rejected {
            thread_id: message.thread_id().to_string(),
            reason: reason.to_string(),
        });
        Ok(AdmissionDecision::Rejected)
    }

    /// Emit a queue event. Exposed so the orchestrator can report
    /// lifecycle steps (e.g. "auto approved") that happen outside the
    /// queue's own admission/approval methods.
    pub fn notify(&self, event: QueueEvent) {
        self.emit(event);
    }

    pub fn get_pending_message(&self, thread_id: &str) -> Option<Message> {
        self.pending.lock().expect("lock poisoned").get(thread_id).cloned()
    }

    /// Annotate a pending message with the provider's synthesized reply,
    /// leaving `content` (the peer's actual inbound text) untouched, and
    /// persist the change to its thread.
    pub fn set_proposed_reply(&self, thread_id: &str, reply: String) -> Result<(), QueueError> {
        let snapshot = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let message = pending
                .get_mut(thread_id)
                .ok_or_else(|| QueueError::NotPending(thread_id.to_string()))?;
            message.common_mut().proposed_reply = Some(reply);
            message.clone()
        };
        self.rewrite_last(&snapshot)
    }

    pub fn peek_pending(&self) -> Vec<Message> {
        self.pending
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|m| m.status() == MessageStatus::PendingHumanReview)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.peek_pending().len()
    }

    pub fn mark_status(&self, thread_id: &str, status: MessageStatus) -> Result<(), QueueError> {
        let mut message = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            pending
                .get_mut(thread_id)
                .map(|m| {
                    m.set_status(status);
                    m.clone()
                })
                .ok_or_else(|| QueueError::NotPending(thread_id.to_string()))?
        };
        message.set_status(status);
        self.rewrite_last(&message)
    }

    /// Approve a pending message, optionally replacing its proposed content
    /// with an edited reply. A non-empty edit is logged as a correction and
    /// may trigger pattern extraction every `PATTERN_EXTRACTION_EVERY`th
    /// correction.
    pub fn approve(&self, thread_id: &str, edited_reply: Option<String>) -> Result<Message, QueueError> {
        let mut message = self
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(thread_id)
            .ok_or_else(|| QueueError::NotPending(thread_id.to_string()))?;

        let proposed = message.common().proposed_reply.clone().unwrap_or_default();
        let final_reply = edited_reply.unwrap_or_else(|| proposed.clone());

        // Logged whenever there was a proposed reply to approve, even if the
        // owner approved it unedited — `edited == original` is still a
        // correction record, informative for maturity accounting.
        if !proposed.is_empty() {
            self.store.append_correction(&Correction {
                thread_id: thread_id.to_string(),
                original: proposed.clone(),
                edited: final_reply.clone(),
                timestamp: chrono::Utc::now(),
            })?;
            let count = self.store.read_corrections()?.len();
            self.emit(QueueEvent::CorrectionLogged {
                thread_id: thread_id.to_string(),
                count,
            });
        }

        if !final_reply.is_empty() {
            message.common_mut().content = final_reply;
        }
        message.common_mut().proposed_reply = None;
        message.set_status(MessageStatus::Approved);
        self.rewrite_last(&message)?;
        self.enqueue_outbound(message.clone())?;
        Ok(message)
    }

    pub fn reject_pending(&self, thread_id: &str) -> Result<Message, QueueError> {
        let mut message = self
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(thread_id)
            .ok_or_else(|| QueueError::NotPending(thread_id.to_string()))?;
        message.set_status(MessageStatus::Rejected);
        self.rewrite_last(&message)?;
        Ok(message)
    }

    /// Whether the given correction count is a pattern-extraction trigger
    /// point (every fifth, non-zero).
    pub fn is_pattern_extraction_checkpoint(count: usize) -> bool {
        count > 0 && count % PATTERN_EXTRACTION_EVERY == 0
    }

    pub fn enqueue_outbound(&self, message: Message) -> Result<(), QueueError> {
        self.outbound_tx.send(message).ok();
        Ok(())
    }

    /// Scan all threads and reload any message whose last entry is still
    /// pending review, so restarts don't lose in-flight reviews.
    pub fn restore_pending(&self) -> Result<usize, QueueError> {
        let mut restored = 0;
        for thread_id in self.store.list_threads()? {
            let thread = self.store.read_thread(&thread_id)?;
            let Some(last) = thread.last() else { continue };
            let Ok(message) = serde_json::from_value::<Message>(last.clone()) else {
                continue;
            };
            if message.status() == MessageStatus::PendingHumanReview {
                self.pending.lock().expect("lock poisoned").insert(thread_id, message);
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommonFields, ThreadMessageBody};
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, Queue) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.initialize(&serde_json::Value::Null).unwrap();
        (dir, Queue::new(Arc::new(store)))
    }

    fn sample_message() -> Message {
        Message::ThreadMessage(ThreadMessageBody {
            common: CommonFields::new("did:wba:other:bob", "did:wba:localhost%3A7777:node0", "hi"),
            subject: "".into(),
        })
    }

    #[test]
    fn blocked_peer_is_rejected_before_mood_check() {
        let (_dir, queue) = queue();
        let peers = PeerManager::new(&queue.store);
        peers.add_or_update("did:wba:other:bob", |p| p.blocked = true).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::Rejected);
    }

    #[test]
    fn dnd_mood_rejects_even_trusted_peers() {
        let (_dir, queue) = queue();
        queue.store.set_mood(Mood::Dnd).unwrap();
        let peers = PeerManager::new(&queue.store);
        peers.add_or_update("did:wba:other:bob", |p| p.trust_score = 1.0).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::Rejected);
    }

    #[test]
    fn auto_approve_flag_overrides_everything_else() {
        let (_dir, queue) = queue();
        queue.store.set_auto_approve(true).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::AutoApproved);
    }

    #[test]
    fn available_mood_with_trusted_peer_auto_approves() {
        let (_dir, queue) = queue();
        queue.store.set_mood(Mood::Available).unwrap();
        let peers = PeerManager::new(&queue.store);
        peers.add_or_update("did:wba:other:bob", |p| p.trust_score = 0.5).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::AutoApproved);
    }

    #[test]
    fn available_mood_with_untrusted_peer_falls_to_review() {
        let (_dir, queue) = queue();
        queue.store.set_mood(Mood::Available).unwrap();
        let peers = PeerManager::new(&queue.store);
        peers.add_or_update("did:wba:other:bob", |p| p.trust_score = 0.1).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::PendingHumanReview);
    }

    #[test]
    fn moderate_mood_with_low_maturity_goes_to_review() {
        let (_dir, queue) = queue();
        queue.store.set_mood(Mood::Moderate).unwrap();
        let peers = PeerManager::new(&queue.store);
        peers.add_or_update("did:wba:other:bob", |p| p.trust_score = 1.0).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::PendingHumanReview);
    }

    #[test]
    fn approve_with_edit_logs_a_correction() {
        let (_dir, queue) = queue();
        queue.store.set_auto_approve(true).unwrap();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        queue.enqueue_inbound(message).unwrap();
        queue.set_proposed_reply(&thread_id, "Hi Bob!".to_string()).unwrap();

        queue.approve(&thread_id, Some("Hello there!".to_string())).unwrap();
        let corrections = queue.store.read_corrections().unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].original, "Hi Bob!");
        assert_eq!(corrections[0].edited, "Hello there!");
    }

    #[test]
    fn approve_without_edit_still_logs_an_unedited_correction() {
        let (_dir, queue) = queue();
        queue.store.set_auto_approve(true).unwrap();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        queue.enqueue_inbound(message).unwrap();
        queue.set_proposed_reply(&thread_id, "Hi Bob!".to_string()).unwrap();

        queue.approve(&thread_id, None).unwrap();
        let corrections = queue.store.read_corrections().unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].original, corrections[0].edited);
    }

    #[test]
    fn approve_of_empty_proposed_reply_logs_nothing() {
        let (_dir, queue) = queue();
        queue.store.set_auto_approve(true).unwrap();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        queue.enqueue_inbound(message).unwrap();

        queue.approve(&thread_id, None).unwrap();
        assert_eq!(queue.store.read_corrections().unwrap().len(), 0);
    }

    #[test]
    fn approve_preserves_the_peers_original_content_until_approval() {
        let (_dir, queue) = queue();
        queue.store.set_auto_approve(true).unwrap();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        queue.enqueue_inbound(message).unwrap();
        queue.set_proposed_reply(&thread_id, "synthesized reply".to_string()).unwrap();

        let pending = queue.get_pending_message(&thread_id).unwrap();
        assert_eq!(pending.common().content, "hi");
        assert_eq!(pending.common().proposed_reply.as_deref(), Some("synthesized reply"));

        let approved = queue.approve(&thread_id, None).unwrap();
        assert_eq!(approved.common().content, "synthesized reply");
        assert!(approved.common().proposed_reply.is_none());
    }

    #[test]
    fn unknown_sender_defaults_to_zero_trust_and_falls_to_review() {
        let (_dir, queue) = queue();
        queue.store.set_mood(Mood::Available).unwrap();
        let decision = queue.enqueue_inbound(sample_message()).unwrap();
        assert_eq!(decision, AdmissionDecision::PendingHumanReview);
    }

    #[test]
    fn pattern_extraction_checkpoint_is_every_fifth() {
        assert!(!Queue::is_pattern_extraction_checkpoint(0));
        assert!(!Queue::is_pattern_extraction_checkpoint(4));
        assert!(Queue::is_pattern_extraction_checkpoint(5));
        assert!(Queue::is_pattern_extraction_checkpoint(10));
    }

    #[test]
    fn restore_pending_reloads_unfinished_reviews() {
        let (_dir, queue) = queue();
        let message = sample_message();
        let thread_id = message.thread_id().to_string();
        queue.enqueue_inbound(message).unwrap();
        assert_eq!(queue.pending_count(), 1);

        let store = Arc::clone(&queue.store);
        let fresh_queue = Queue::new(store);
        let restored = fresh_queue.restore_pending().unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fresh_queue.pending_count(), 1);
        let _ = thread_id;
    }
}
