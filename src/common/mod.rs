//! Node descriptor shared between the cluster layer and the outer agent.
//!
//! A [`Node`] is a peer's durable identity: a cluster-unique name, the socket
//! address its gossip engine advertises, and an opaque metadata blob. The blob
//! decodes into the WireGuard-facing part of the descriptor (overlay address,
//! public key, advertised routes). Decoding is defensive: a malformed blob
//! yields a [`MetaError`] and excludes that peer from the usable view, it never
//! takes the process down.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Upper bound for an encoded metadata blob, in bytes.
///
/// The gossip engine piggybacks the blob on every roster sync, so it must stay
/// small enough to fit a UDP datagram alongside the rest of the message.
pub const META_LIMIT: usize = 512;

/// Errors produced by the metadata codec.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The blob did not deserialize into a descriptor.
    #[error("malformed node metadata: {0}")]
    Decode(#[source] bincode::Error),

    /// The descriptor serialized to more than the engine accepts.
    #[error("encoded metadata is {len} bytes, limit is {limit}")]
    TooLarge {
        /// Actual encoded size.
        len: usize,
        /// Maximum the engine will gossip.
        limit: usize,
    },

    /// The descriptor failed to serialize at all.
    #[error("could not encode node metadata: {0}")]
    Encode(#[source] bincode::Error),
}

/// The gossiped part of a node descriptor.
///
/// Kept as a separate struct so the wire layout of the blob is independent of
/// whatever bookkeeping fields `Node` grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct NodeMeta {
    overlay_addr: Option<IpNet>,
    pub_key: String,
    routes: Vec<IpNet>,
}

/// A peer's identity and descriptor as seen by the cluster layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Cluster-unique name.
    pub name: String,
    /// Advertised gossip socket address.
    pub addr: SocketAddr,
    /// Opaque metadata blob as received from the engine.
    pub meta: Vec<u8>,
    /// Address of this peer inside the overlay network.
    pub overlay_addr: Option<IpNet>,
    /// WireGuard public key, base64 as the kernel reports it.
    pub pub_key: String,
    /// Networks this peer advertises routes for.
    pub routes: Vec<IpNet>,
}

impl Node {
    /// Create a descriptor with an empty metadata section.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
            overlay_addr: None,
            pub_key: String::new(),
            routes: Vec::new(),
        }
    }

    /// Serialize the descriptor fields into the gossiped blob.
    ///
    /// Fails if the encoded form exceeds `limit`; callers surface that as a
    /// configuration error since it means the local routes list is too big to
    /// disseminate.
    pub fn encode_meta(&self, limit: usize) -> Result<Vec<u8>, MetaError> {
        let meta = NodeMeta {
            overlay_addr: self.overlay_addr,
            pub_key: self.pub_key.clone(),
            routes: self.routes.clone(),
        };
        let blob = bincode::serialize(&meta).map_err(MetaError::Encode)?;
        if blob.len() > limit {
            return Err(MetaError::TooLarge {
                len: blob.len(),
                limit,
            });
        }
        Ok(blob)
    }

    /// Decode `self.meta` back into the descriptor fields.
    pub fn decode_meta(&mut self) -> Result<(), MetaError> {
        let meta: NodeMeta = bincode::deserialize(&self.meta).map_err(MetaError::Decode)?;
        self.overlay_addr = meta.overlay_addr;
        self.pub_key = meta.pub_key;
        self.routes = meta.routes;
        Ok(())
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}
