//! The bridge between the engine's raw event stream and the outer agent.
//!
//! One background task per cluster drains the engine's buffered event channel
//! and, for every non-self event, republishes the *entire* current membership
//! (recomputed from the engine's live roster, excluding the local node) on a
//! capacity-1 downstream channel. Recomputing the full set on every event is
//! deliberate: an incremental diff would drift if a single event were ever
//! missed or reordered, a fresh enumeration cannot. The snapshot is also
//! copied into the persisted state and opportunistically saved.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::common::Node;
use crate::gossip::{EventKind, GossipEngine, MemberEvent};

use super::state::ClusterState;

/// Buffer size of the engine-to-bridge event channel.
///
/// Must be generous: if it ever fills, the engine's own loops block on the
/// next emit. A hundred simultaneous member transitions is far beyond
/// realistic churn for the mesh sizes this targets, and a fixed bound keeps a
/// wedged consumer from growing the queue without limit.
pub(crate) const EVENT_BUFFER: usize = 100;

/// Spawn the bridge task. Returns the snapshot stream handed to the caller of
/// `Cluster::members`.
pub(crate) fn spawn(
    engine: Arc<GossipEngine>,
    state: Arc<Mutex<ClusterState>>,
    state_dir: PathBuf,
    cluster_name: String,
    mut events: mpsc::Receiver<MemberEvent>,
) -> mpsc::Receiver<Vec<Node>> {
    // capacity 1: publishing waits for the consumer, so a slow consumer
    // naturally coalesces bursts into the latest snapshot
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let local_name = engine.local_name().to_string();

        while let Some(event) = events.recv().await {
            if event.member.name == local_name {
                // never republish our own transitions
                continue;
            }
            match event.kind {
                EventKind::Joined => info!(node = %event.member, "member joined"),
                EventKind::Updated => info!(node = %event.member, "member updated"),
                EventKind::Left => info!(node = %event.member, "member left"),
            }

            let nodes: Vec<Node> = engine
                .members()
                .into_iter()
                .filter(|member| member.name != local_name)
                .map(|member| {
                    let mut node = Node::new(member.name, member.addr);
                    node.meta = member.meta;
                    node
                })
                .collect();

            let snapshot = {
                let mut state = state.lock().await;
                state.nodes = nodes.clone();
                state.clone()
            };

            if tx.send(nodes).await.is_err() {
                debug!("membership consumer dropped, stopping event bridge");
                break;
            }

            // opportunistic: a failed save only costs rejoin convenience
            if let Err(e) = snapshot.save(&state_dir, &cluster_name) {
                warn!("could not save cluster state: {e}");
            }
        }
    });

    rx
}
