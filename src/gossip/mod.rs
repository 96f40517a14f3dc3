//! Gossip Membership Engine
//!
//! Implements the membership protocol the cluster layer builds on: a UDP-based
//! Gossip protocol (SWIM-inspired) for node discovery, failure detection, and
//! metadata dissemination.
//!
//! ## Core Mechanisms
//! - **Sealed transport**: every datagram is encrypted and authenticated with
//!   the 32-byte cluster secret. A node holding the wrong key cannot read or
//!   inject traffic, so it can never join.
//! - **Anti-entropy**: Ping/Ack exchanges carry the full roster, so missed
//!   events heal on the next gossip round. A ping from an unknown sender
//!   inserts it, so even a peer restarting with no state is pulled back in.
//! - **Tombstone reclamation**: dead and departed entries are kept only for a
//!   retention window and never gossiped, keeping the table and the roster
//!   datagram bounded under churn.
//! - **Incarnation numbers**: a per-node logical clock orders competing claims
//!   about the same member and lets a falsely suspected node refute.
//! - **Delegate hooks**: the embedding layer supplies the local metadata blob
//!   and the identity conflict-resolution policy.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod types;


pub use config::GossipConfig;
pub use engine::GossipEngine;
pub use types::{
    ConflictOutcome, Delegate, EventKind, GossipError, Member, MemberEvent, MemberState,
};
