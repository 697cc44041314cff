//! Identity, wire protocol, store, trust, lifecycle and provider layer for
//! an Esence P2P agent node.

pub mod identity;
pub mod maturity;
pub mod message;
pub mod patterns;
pub mod peers;
pub mod provider;
pub mod queue;
pub mod store;
pub mod transport;

pub use identity::{Identity, IdentityDocument, IdentityError};
pub use maturity::{calculate_maturity, maturity_label};
pub use message::{Message, MessageError, MessageStatus};
pub use peers::{PeerManager, PeerRecord};
pub use queue::{AdmissionDecision, Queue, QueueError};
pub use store::{Store, StoreError};
