use crate::common::MetaError;
use crate::gossip::GossipError;

/// Errors surfaced by the cluster coordination layer.
///
/// Configuration problems (`InvalidKeyLength`, `Meta`) are fatal at startup.
/// `NoPeersJoined` feeds the caller's retry loop. Persistence problems never
/// show up here at all: state load/save degrade gracefully and are only
/// logged.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// An explicit cluster key was supplied with the wrong length.
    #[error("cluster key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length.
        expected: usize,
        /// Length of the supplied key.
        actual: usize,
    },

    /// The OS random source failed while generating a fresh cluster key.
    #[error("could not generate cluster key: {0}")]
    KeyGeneration(#[source] std::io::Error),

    /// Join was attempted against at least one address but the cluster still
    /// only contains the local node.
    #[error("could not join any of the provided addresses")]
    NoPeersJoined,

    /// The local descriptor could not be encoded for dissemination.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// The underlying gossip engine failed.
    #[error(transparent)]
    Gossip(#[from] GossipError),

    /// The membership snapshot stream was already handed out.
    #[error("the membership stream has already been taken")]
    MembersAlreadyTaken,

    /// State file could not be written (only surfaced on explicit saves, the
    /// opportunistic path logs and drops it).
    #[error("could not persist cluster state: {0}")]
    Persist(#[source] std::io::Error),
}
