//! Durable cluster state.
//!
//! One JSON file per cluster name, holding the shared secret and the last
//! observed peer list. The file is a convenience cache: losing it only costs
//! rejoin comfort (fresh seed addresses are needed again), never correctness,
//! so every failure path here degrades instead of propagating.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::Node;

use super::error::ClusterError;

/// Default directory for state files; overridable per cluster config.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/wiremesh";

/// Snapshot of everything worth surviving a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    /// Shared cluster secret, filled in by key bootstrap.
    pub cluster_key: Option<Vec<u8>>,
    /// Peers observed in the last published membership snapshot.
    pub nodes: Vec<Node>,
}

impl ClusterState {
    fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.json"))
    }

    /// Load the state persisted for `name`, or the default state if the file
    /// is absent or unreadable. Never an error: the gossip engine is the
    /// source of truth, this is only a cache.
    pub fn load(dir: &Path, name: &str) -> Self {
        let path = Self::path(dir, name);
        match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(state) => {
                    debug!(path = %path.display(), "loaded cluster state");
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), "corrupt cluster state, starting fresh: {e}");
                    Self::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), "could not read cluster state, starting fresh: {e}");
                Self::default()
            }
        }
    }

    /// Write the state for `name`. Atomic: the content lands in a temp file
    /// first and is renamed into place, so a crash mid-save never leaves a
    /// half-written file behind.
    pub fn save(&self, dir: &Path, name: &str) -> Result<(), ClusterError> {
        std::fs::create_dir_all(dir).map_err(ClusterError::Persist)?;

        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| ClusterError::Persist(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let path = Self::path(dir, name);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &raw).map_err(ClusterError::Persist)?;
        std::fs::rename(&tmp, &path).map_err(ClusterError::Persist)?;

        debug!(path = %path.display(), nodes = self.nodes.len(), "saved cluster state");
        Ok(())
    }
}
