//! Party line overlay protocol engine.
//! Host-driven: no I/O; host passes datagrams and clock ticks and receives actions.

pub mod bootstrap;
pub mod chat;
pub mod config;
pub mod core;
pub mod identity;
pub mod keys;
pub mod lookup;
pub mod protocol;
pub mod routing;
pub mod scheduler;
pub mod wire;

mod broadcast;
mod liveness;
mod membership;
mod secure;

pub use crate::bootstrap::{BootstrapToken, BootstrapTokenError};
pub use crate::chat::{ChatEntry, ChatLog};
pub use crate::config::OverlayConfig;
pub use crate::core::{FatalError, JoinState, OutboundAction, OverlayCore, SendError};
pub use crate::identity::{CryptoError, Identity, NodeId, PublicKey};
pub use crate::protocol::{Payload, PeerRecord};
pub use crate::routing::{distance, Distance, RoutingTable, TABLE_SIZE};
pub use crate::wire::{Envelope, EnvelopeError};
