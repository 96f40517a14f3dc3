use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Fixed length of the cluster secret, in bytes.
pub const KEY_LEN: usize = 32;

/// Port a cluster gossips on unless configured otherwise. Every node of a
/// cluster is expected to listen on the same port, so this is also the port
/// assumed for seed targets given without one.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Configuration for a [`GossipEngine`](super::GossipEngine) instance.
///
/// Timing fields default to values tuned for WAN-ish links; tests shrink them
/// to converge fast on loopback.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Symmetric secret shared by every node of the cluster.
    pub secret_key: [u8; KEY_LEN],
    /// Local address to bind the UDP socket to.
    pub bind_addr: IpAddr,
    /// Local port to bind; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Address other nodes should contact us at; falls back to `bind_addr`.
    pub advertise_addr: Option<IpAddr>,
    /// Port other nodes should contact us at; 0 falls back to the bound port.
    pub advertise_port: u16,
    /// Explicit local name; `None` lets the engine assign one.
    pub name: Option<String>,
    /// How often a random live peer is pinged.
    pub probe_interval: Duration,
    /// Silence before an alive member becomes suspect.
    pub suspect_timeout: Duration,
    /// Further silence before a suspect member is declared dead.
    pub dead_timeout: Duration,
    /// How long a dead or departed member's entry is remembered before it is
    /// dropped from the table entirely. Must exceed `dead_timeout`.
    pub reclaim_timeout: Duration,
    /// How long `join` waits for a contacted seed to show up in the roster.
    pub join_timeout: Duration,
}

impl GossipConfig {
    /// Config with default timings for the given secret.
    pub fn new(secret_key: [u8; KEY_LEN]) -> Self {
        Self {
            secret_key,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_GOSSIP_PORT,
            advertise_addr: None,
            advertise_port: 0,
            name: None,
            probe_interval: Duration::from_millis(500),
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(10),
            reclaim_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(3),
        }
    }
}
