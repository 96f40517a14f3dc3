//! The delegate registered with the gossip engine on behalf of the cluster.
//!
//! Closes over the local node descriptor and provides the two hooks the engine
//! needs: the metadata codec (what blob to gossip for the local identity) and
//! the conflict-resolution policy for competing identity claims.

use crate::common::{MetaError, Node, META_LIMIT};
use crate::gossip::types::{default_winner, ConflictOutcome, Delegate, Member};

/// Engine delegate closing over the local node descriptor.
///
/// The metadata blob is encoded once at construction so a codec problem
/// surfaces as a startup error instead of silently gossiping an empty blob.
pub(crate) struct NodeDelegate {
    local: Node,
    meta: Vec<u8>,
}

impl NodeDelegate {
    pub(crate) fn new(local: Node) -> Result<Self, MetaError> {
        let meta = local.encode_meta(META_LIMIT)?;
        Ok(Self { local, meta })
    }
}

impl Delegate for NodeDelegate {
    fn local_meta(&self, _limit: usize) -> Vec<u8> {
        self.meta.clone()
    }

    fn resolve_conflict(&self, current: &Member, candidate: &Member) -> ConflictOutcome {
        // a dispute about our own name is never lost: the local descriptor is
        // authoritative for the local identity
        if candidate.name == self.local.name {
            return ConflictOutcome::KeepCurrent;
        }
        default_winner(current, candidate)
    }
}
