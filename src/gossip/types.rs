use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Errors surfaced by the gossip engine.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Socket-level failure (bind, send, receive).
    #[error("gossip transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A message failed to serialize before sealing.
    #[error("gossip codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A received datagram failed authentication or was truncated.
    #[error("gossip packet rejected: {0}")]
    Reject(&'static str),

    /// The delegate produced a metadata blob larger than the engine gossips.
    #[error("node metadata is {len} bytes, limit is {limit}")]
    MetaTooLarge {
        /// Actual blob size.
        len: usize,
        /// Engine limit.
        limit: usize,
    },
}

/// Lifecycle state of a member as tracked by failure detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// A single member of the cluster as the engine sees it.
///
/// The `incarnation` field is a logical clock used to order updates and
/// resolve disputes (e.g., refuting a false "Suspect" claim, or picking the
/// winner between two descriptors claiming the same name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique name.
    pub name: String,
    /// Advertised gossip address.
    pub addr: SocketAddr,
    /// Opaque metadata blob supplied by the member's delegate.
    pub meta: Vec<u8>,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Member {
    /// True if failure detection still counts this member as part of the
    /// cluster (alive or merely suspected).
    pub fn is_active(&self) -> bool {
        matches!(self.state, MemberState::Alive | MemberState::Suspect)
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// What kind of transition an event notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Joined,
    Updated,
    Left,
}

/// Event notification emitted on a member transition.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub member: Member,
    pub kind: EventKind,
}

/// Winner of an identity conflict between two claims for the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    KeepCurrent,
    TakeCandidate,
}

/// Hooks the embedding layer registers with the engine.
///
/// `local_meta` is the metadata codec half: it produces the blob gossiped
/// alongside the local identity. `resolve_conflict` picks the authoritative
/// claim when two members advertise the same name from different addresses;
/// the policy must be deterministic and symmetric so every node converges on
/// the same winner without coordination.
pub trait Delegate: Send + Sync {
    /// Metadata blob for the local node, at most `limit` bytes.
    fn local_meta(&self, limit: usize) -> Vec<u8>;

    /// Decide between the currently held claim and a gossiped candidate.
    fn resolve_conflict(&self, current: &Member, candidate: &Member) -> ConflictOutcome;
}

/// Default conflict tie-break when no delegate is registered (and the policy
/// delegates fall back to): higher incarnation wins, equal incarnations break
/// on the greater advertise address. Comparing the same pair from either side
/// yields the same winner, which is what convergence needs.
pub fn default_winner(current: &Member, candidate: &Member) -> ConflictOutcome {
    let cur = (current.incarnation, current.addr.to_string());
    let cand = (candidate.incarnation, candidate.addr.to_string());
    if cand > cur {
        ConflictOutcome::TakeCandidate
    } else {
        ConflictOutcome::KeepCurrent
    }
}

/// The wire protocol for inter-node communication.
///
/// - `Ping/Ack`: liveness checks plus full-roster anti-entropy.
/// - `Join`: sent to seed addresses to enter the cluster.
/// - `Alive`: announces (or refutes suspicion of) a member, carrying its
///   current descriptor so metadata refreshes propagate.
/// - `Suspect`: disseminates a suspected failure.
/// - `Leave`: graceful departure announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: String,
        incarnation: u64,
    },

    Ack {
        from: String,
        incarnation: u64,
        members: Vec<Member>,
    },

    Join {
        member: Member,
    },

    Alive {
        member: Member,
    },

    Suspect {
        name: String,
        incarnation: u64,
    },

    Leave {
        name: String,
        incarnation: u64,
    },
}
