//! Cluster key bootstrap.
//!
//! The effective shared secret is, in order of precedence: an explicit
//! override, the value persisted from a previous run, or a freshly generated
//! random key. A freshly generated key is shown once (base64) when stdout is a
//! terminal, so an operator can distribute it to the other nodes out-of-band.

use std::io::IsTerminal;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::gossip::config::KEY_LEN;

use super::error::ClusterError;
use super::state::ClusterState;

/// Resolve the effective cluster key and write it back into `state` so the
/// next save persists it. `explicit` must already be length-validated by the
/// caller.
pub fn resolve_key(
    explicit: Option<Vec<u8>>,
    state: &mut ClusterState,
) -> Result<[u8; KEY_LEN], ClusterError> {
    let raw = match explicit {
        Some(key) => {
            debug!("using explicitly provided cluster key");
            key
        }
        None => match state.cluster_key.take() {
            Some(key) if key.len() == KEY_LEN => {
                debug!("using persisted cluster key");
                key
            }
            Some(key) => {
                debug!(len = key.len(), "persisted cluster key has bad length, regenerating");
                generate_key()?
            }
            None => generate_key()?,
        },
    };

    let mut key = [0u8; KEY_LEN];
    if raw.len() != KEY_LEN {
        return Err(ClusterError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: raw.len(),
        });
    }
    key.copy_from_slice(&raw);

    state.cluster_key = Some(raw);
    Ok(key)
}

fn generate_key() -> Result<Vec<u8>, ClusterError> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| ClusterError::KeyGeneration(std::io::Error::other(e)))?;

    if std::io::stdout().is_terminal() {
        println!("new cluster key generated: {}", BASE64.encode(&key));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_key_wins_over_persisted() {
        let mut state = ClusterState::default();
        state.cluster_key = Some(vec![1u8; KEY_LEN]);

        let key = resolve_key(Some(vec![2u8; KEY_LEN]), &mut state).unwrap();

        assert_eq!(key, [2u8; KEY_LEN]);
        assert_eq!(state.cluster_key, Some(vec![2u8; KEY_LEN]));
    }

    #[test]
    fn persisted_key_wins_over_generation() {
        let mut state = ClusterState::default();
        state.cluster_key = Some(vec![3u8; KEY_LEN]);

        let key = resolve_key(None, &mut state).unwrap();

        assert_eq!(key, [3u8; KEY_LEN]);
        assert_eq!(state.cluster_key, Some(vec![3u8; KEY_LEN]));
    }

    #[test]
    fn absent_keys_generate_a_fresh_random_one() {
        let mut state = ClusterState::default();
        let key = resolve_key(None, &mut state).unwrap();

        assert_ne!(key, [0u8; KEY_LEN]);
        assert_eq!(state.cluster_key.as_deref(), Some(&key[..]));

        // a second bootstrap from empty state must not repeat the key
        let mut other = ClusterState::default();
        let other_key = resolve_key(None, &mut other).unwrap();
        assert_ne!(key, other_key);
    }

    #[test]
    fn explicit_key_with_bad_length_is_rejected() {
        let mut state = ClusterState::default();
        let err = resolve_key(Some(vec![0u8; 16]), &mut state).unwrap_err();

        assert!(matches!(
            err,
            ClusterError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: 16
            }
        ));
    }
}
