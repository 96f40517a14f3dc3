//! Cluster Coordination Layer
//!
//! Composes the persisted state store, key bootstrap, membership delegate,
//! join/leave control, and the event bridge behind one [`Cluster`] facade.
//!
//! Lifecycle: construct with [`Cluster::new`] (loads state, bootstraps the
//! key, starts the engine), call [`Cluster::update`] with the local descriptor
//! (first call wires the delegate and event sink), take the snapshot stream
//! with [`Cluster::members`] *before* joining to avoid missing the initial
//! events, then [`Cluster::join`]. On shutdown, [`Cluster::leave`] persists
//! state before announcing departure.

pub mod error;
pub mod key;
pub mod state;

mod bridge;
mod delegate;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::common::Node;
use crate::gossip::config::{DEFAULT_GOSSIP_PORT, KEY_LEN};
use crate::gossip::{GossipConfig, GossipEngine, MemberEvent};

use delegate::NodeDelegate;

pub use error::ClusterError;
pub use state::{ClusterState, DEFAULT_STATE_DIR};

/// Bound on the departure broadcast; shutdown proceeds unconditionally after.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a local descriptor refresh may spend propagating.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Construction parameters for a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster/interface name; keys the state file.
    pub name: String,
    /// Discard persisted state and start from scratch.
    pub init: bool,
    /// Explicit cluster key override; must be exactly 32 bytes when present.
    pub cluster_key: Option<Vec<u8>>,
    /// Address the gossip socket binds to.
    pub bind_addr: IpAddr,
    /// Port the gossip socket binds to; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Address advertised to peers; defaults to the bind address.
    pub advertise_addr: Option<IpAddr>,
    /// Port advertised to peers; 0 falls back to the bound port.
    pub advertise_port: u16,
    /// Use the bind address as the node name instead of a generated one.
    pub use_addr_as_name: bool,
    /// Where state files live.
    pub state_dir: PathBuf,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: false,
            cluster_key: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_GOSSIP_PORT,
            advertise_addr: None,
            advertise_port: 0,
            use_addr_as_name: false,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

/// A running cluster membership instance.
pub struct Cluster {
    cluster_name: String,
    state_dir: PathBuf,
    /// Port every node of the cluster is assumed to gossip on; fills in seed
    /// targets given without a port.
    cluster_port: u16,
    engine: Arc<GossipEngine>,
    state: Arc<Mutex<ClusterState>>,
    events_tx: mpsc::Sender<MemberEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<MemberEvent>>>,
}

impl Cluster {
    /// Load (or reinitialize) state, bootstrap the cluster key, and start the
    /// gossip engine. The instance is ready to be [`update`](Self::update)d
    /// with the local descriptor and then joined.
    pub async fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        if let Some(key) = &config.cluster_key {
            if key.len() != KEY_LEN {
                return Err(ClusterError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: key.len(),
                });
            }
        }

        let mut state = if config.init {
            ClusterState::default()
        } else {
            ClusterState::load(&config.state_dir, &config.name)
        };
        let key = key::resolve_key(config.cluster_key.clone(), &mut state)?;

        let mut gossip = GossipConfig::new(key);
        gossip.bind_addr = config.bind_addr;
        gossip.bind_port = config.bind_port;
        gossip.advertise_addr = config.advertise_addr;
        gossip.advertise_port = config.advertise_port;
        if config.use_addr_as_name && !config.bind_addr.is_unspecified() {
            gossip.name = Some(config.bind_addr.to_string());
        }

        let engine = GossipEngine::create(gossip).await?;

        // Generous buffer between the engine and the bridge: more simultaneous
        // transitions than this would stall the engine's own loops.
        let (events_tx, events_rx) = mpsc::channel(bridge::EVENT_BUFFER);

        Ok(Self {
            cluster_name: config.name,
            state_dir: config.state_dir,
            cluster_port: if config.bind_port != 0 {
                config.bind_port
            } else {
                DEFAULT_GOSSIP_PORT
            },
            engine,
            state: Arc::new(Mutex::new(state)),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// The locally assigned identity, configured or engine-generated.
    pub fn name(&self) -> &str {
        self.engine.local_name()
    }

    /// Socket address other nodes contact this instance at.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.engine.advertise_addr()
    }

    /// Gossip the local node descriptor, propagating any change.
    ///
    /// The first call installs the delegate and event wiring on the engine;
    /// later calls are metadata refreshes.
    pub async fn update(&self, local_node: Node) -> Result<(), ClusterError> {
        let delegate = NodeDelegate::new(local_node)?;
        self.engine.set_delegate(Arc::new(delegate)).await;
        self.engine.set_event_sink(self.events_tx.clone()).await;
        self.engine.update_local_node(UPDATE_TIMEOUT).await?;
        Ok(())
    }

    /// Try to join the cluster by contacting the given hosts.
    ///
    /// Hosts may be `ip:port`, a bare IP (cluster port assumed), or a DNS
    /// name; unresolvable names are skipped. With no usable host at all, the
    /// peers persisted from the previous run are contacted instead. Addresses
    /// that are already members are filtered out; joining nothing new is a
    /// no-op. Joining at least one address without ending up in a cluster of
    /// two is an error for the caller's retry loop.
    pub async fn join(&self, hosts: &[String]) -> Result<(), ClusterError> {
        let mut addrs = self.resolve_targets(hosts).await;

        // cold-start rejoin from the last known peer list
        if addrs.is_empty() {
            let state = self.state.lock().await;
            addrs = state.nodes.iter().map(|node| node.addr).collect();
        }

        let members = self.engine.members();
        let targets: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|addr| !members.iter().any(|member| member.addr == *addr))
            .collect();

        if targets.is_empty() {
            debug!("no new join targets, nothing to do");
            return Ok(());
        }

        let contacted = self.engine.join(&targets).await?;
        if self.engine.num_members() < 2 {
            return Err(ClusterError::NoPeersJoined);
        }
        debug!(contacted, total = self.engine.num_members(), "join complete");
        Ok(())
    }

    /// Persist the current state, announce departure (bounded), and stop the
    /// engine. Persisting first keeps the last known peer set durable even if
    /// the process dies mid-leave.
    pub async fn leave(&self) {
        let snapshot = self.state.lock().await.clone();
        if let Err(e) = snapshot.save(&self.state_dir, &self.cluster_name) {
            warn!("could not save cluster state before leaving: {e}");
        }
        self.engine.leave(LEAVE_TIMEOUT).await;
        self.engine.shutdown();
    }

    /// The stream of full-membership snapshots, published once per engine
    /// event. One-shot: the stream can only be taken once.
    pub fn members(&self) -> Result<mpsc::Receiver<Vec<Node>>, ClusterError> {
        let events = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(ClusterError::MembersAlreadyTaken)?;

        Ok(bridge::spawn(
            Arc::clone(&self.engine),
            Arc::clone(&self.state),
            self.state_dir.clone(),
            self.cluster_name.clone(),
            events,
        ))
    }

    async fn resolve_targets(&self, hosts: &[String]) -> Vec<SocketAddr> {
        // targets without a port get the cluster's port, not this instance's
        // advertise port; the two differ when we advertise somewhere unusual
        let default_port = self.cluster_port;
        let mut addrs = Vec::with_capacity(hosts.len());

        for host in hosts {
            if let Ok(addr) = host.parse::<SocketAddr>() {
                addrs.push(addr);
            } else if let Ok(ip) = host.parse::<IpAddr>() {
                addrs.push(SocketAddr::new(ip, default_port));
            } else {
                match tokio::net::lookup_host((host.as_str(), default_port)).await {
                    Ok(resolved) => addrs.extend(resolved),
                    Err(e) => debug!(%host, "skipping unresolvable join target: {e}"),
                }
            }
        }
        addrs
    }
}
