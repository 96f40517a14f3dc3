//! Cluster Membership Library for a Self-Organizing Mesh Agent
//!
//! This library crate maintains the dynamically changing set of peer nodes of a
//! WireGuard-style mesh network, bootstraps the shared cluster secret, and
//! streams membership snapshots to the rest of the agent.
//!
//! ## Architecture Modules
//! The crate is composed of three loosely coupled subsystems:
//!
//! - **`common`**: The node descriptor shared with the outer agent. Carries a
//!   peer's identity, network address, and a bounded metadata blob that decodes
//!   into overlay address, public key, and advertised routes.
//! - **`gossip`**: The membership protocol engine. A UDP-based Gossip protocol
//!   (SWIM-like) handles node discovery, failure detection, and metadata
//!   dissemination. Every datagram is sealed with the shared cluster secret.
//! - **`cluster`**: The coordination layer on top of the engine. Owns the
//!   persisted state, resolves the effective cluster key, wires conflict
//!   resolution and the metadata codec into the engine, and republishes the
//!   engine's raw event stream as deduplicated full-membership snapshots.

pub mod cluster;
pub mod common;
pub mod gossip;
