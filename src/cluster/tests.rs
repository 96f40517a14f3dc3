//! Cluster Layer Tests
//!
//! Validates the coordination layer end to end: key precedence, join
//! filtering and quorum, snapshot self-exclusion, persist-before-leave, and
//! the three-instance convergence scenario including cold-start rejoin from
//! persisted state.

mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::cluster::{Cluster, ClusterConfig, ClusterError, ClusterState};
    use crate::common::Node;
    use crate::gossip::config::KEY_LEN;

    fn test_config(name: &str, dir: &Path, key: Option<Vec<u8>>) -> ClusterConfig {
        let mut cfg = ClusterConfig::new(name);
        cfg.bind_addr = "127.0.0.1".parse().unwrap();
        cfg.bind_port = 0;
        cfg.cluster_key = key;
        cfg.state_dir = dir.to_path_buf();
        cfg
    }

    fn descriptor(cluster: &Cluster) -> Node {
        let mut node = Node::new(cluster.name(), cluster.advertise_addr());
        node.overlay_addr = Some("10.42.0.1/32".parse().unwrap());
        node.pub_key = format!("pubkey-of-{}", cluster.name());
        node
    }

    /// Read snapshots until one satisfies `pred`, panicking after `timeout`.
    async fn wait_snapshot(
        rx: &mut mpsc::Receiver<Vec<Node>>,
        pred: impl Fn(&[Node]) -> bool,
        timeout: Duration,
    ) -> Vec<Node> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let snapshot = tokio::time::timeout(remaining, rx.recv())
                .await
                .expect("no matching snapshot within timeout")
                .expect("snapshot stream closed");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    }

    // ============================================================
    // CONFIGURATION ERRORS
    // ============================================================

    #[tokio::test]
    async fn explicit_key_with_wrong_length_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Cluster::new(test_config("wg0", dir.path(), Some(vec![0u8; 16])))
            .await
            .err()
            .expect("short key must be rejected");

        assert!(matches!(
            err,
            ClusterError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: 16
            }
        ));
    }

    #[tokio::test]
    async fn membership_stream_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(test_config("wg0", dir.path(), Some(vec![1u8; KEY_LEN])))
            .await
            .unwrap();

        assert!(cluster.members().is_ok());
        assert!(matches!(
            cluster.members(),
            Err(ClusterError::MembersAlreadyTaken)
        ));

        cluster.leave().await;
    }

    // ============================================================
    // KEY BOOTSTRAP ACROSS RESTARTS
    // ============================================================

    #[tokio::test]
    async fn generated_key_survives_a_restart_through_the_state_file() {
        let dir = tempfile::tempdir().unwrap();

        let first = Cluster::new(test_config("wg0", dir.path(), None)).await.unwrap();
        first.leave().await; // persists state, including the generated key

        let persisted = ClusterState::load(dir.path(), "wg0");
        let key = persisted.cluster_key.clone().expect("key was not persisted");
        assert_eq!(key.len(), KEY_LEN);

        // a second boot without an explicit key must resolve the same secret
        let second = Cluster::new(test_config("wg0", dir.path(), None)).await.unwrap();
        second.leave().await;
        let reloaded = ClusterState::load(dir.path(), "wg0");
        assert_eq!(reloaded.cluster_key, Some(key));
    }

    #[tokio::test]
    async fn init_discards_persisted_peers() {
        let dir = tempfile::tempdir().unwrap();

        let mut state = ClusterState::default();
        state.nodes.push(Node::new("stale", "127.0.0.1:9".parse().unwrap()));
        state.save(dir.path(), "wg0").unwrap();

        let mut cfg = test_config("wg0", dir.path(), Some(vec![1u8; KEY_LEN]));
        cfg.init = true;
        let cluster = Cluster::new(cfg).await.unwrap();

        // with persisted peers discarded there is nothing to contact, so an
        // empty join is a no-op rather than an attempt against "stale"
        cluster.join(&[]).await.unwrap();
        cluster.leave().await;
    }

    // ============================================================
    // JOIN FILTERING AND QUORUM
    // ============================================================

    #[tokio::test]
    async fn join_with_no_targets_and_no_state_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(test_config("wg0", dir.path(), Some(vec![2u8; KEY_LEN])))
            .await
            .unwrap();

        cluster.join(&[]).await.unwrap();
        cluster.leave().await;
    }

    #[tokio::test]
    async fn joining_an_existing_member_is_filtered_to_nothing() {
        let key = vec![3u8; KEY_LEN];
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        let n1 = Cluster::new(test_config("wg0", d1.path(), Some(key.clone())))
            .await
            .unwrap();
        let n2 = Cluster::new(test_config("wg0", d2.path(), Some(key)))
            .await
            .unwrap();

        n1.update(descriptor(&n1)).await.unwrap();
        n2.update(descriptor(&n2)).await.unwrap();
        n2.join(&[n1.advertise_addr().to_string()]).await.unwrap();

        // both addresses are members now; a second join filters them all out
        // and must succeed quickly without treating zero attempts as failure
        n2.join(&[n1.advertise_addr().to_string(), n2.advertise_addr().to_string()])
            .await
            .unwrap();

        n2.leave().await;
        n1.leave().await;
    }

    #[tokio::test]
    async fn join_without_reaching_anyone_is_a_quorum_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(test_config("wg0", dir.path(), Some(vec![4u8; KEY_LEN])))
            .await
            .unwrap();

        // nothing listens on discard; the attempt happens but membership
        // stays at 1, which must be reported as a failure
        let err = cluster.join(&["127.0.0.1:9".to_string()]).await;
        assert!(matches!(err, Err(ClusterError::NoPeersJoined)));

        cluster.leave().await;
    }

    #[tokio::test]
    async fn unresolvable_names_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(test_config("wg0", dir.path(), Some(vec![5u8; KEY_LEN])))
            .await
            .unwrap();

        // resolution fails, the target is skipped, no peers remain to try,
        // and that is a no-op rather than an error
        cluster
            .join(&["definitely-not-a-real-host.invalid".to_string()])
            .await
            .unwrap();

        cluster.leave().await;
    }

    #[tokio::test]
    async fn bare_ip_targets_get_the_cluster_port_not_the_advertise_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config("wg0", dir.path(), Some(vec![10u8; KEY_LEN]));
        // advertise somewhere unusual; seed resolution must not inherit it
        cfg.advertise_port = 40123;
        let cluster = Cluster::new(cfg).await.unwrap();

        let addrs = cluster
            .resolve_targets(&["192.0.2.7".to_string()])
            .await;
        assert_eq!(addrs, vec!["192.0.2.7:7946".parse().unwrap()]);

        // an explicit port is always honored as given
        let addrs = cluster
            .resolve_targets(&["192.0.2.7:5555".to_string()])
            .await;
        assert_eq!(addrs, vec!["192.0.2.7:5555".parse().unwrap()]);

        cluster.leave().await;
    }

    // ============================================================
    // SNAPSHOTS
    // ============================================================

    #[tokio::test]
    async fn snapshots_exclude_the_local_node() {
        let key = vec![6u8; KEY_LEN];
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        let n1 = Cluster::new(test_config("wg0", d1.path(), Some(key.clone())))
            .await
            .unwrap();
        let n2 = Cluster::new(test_config("wg0", d2.path(), Some(key)))
            .await
            .unwrap();

        n1.update(descriptor(&n1)).await.unwrap();
        n2.update(descriptor(&n2)).await.unwrap();
        let mut rx1 = n1.members().unwrap();
        let mut rx2 = n2.members().unwrap();

        n2.join(&[n1.advertise_addr().to_string()]).await.unwrap();

        let s1 = wait_snapshot(&mut rx1, |s| !s.is_empty(), Duration::from_secs(5)).await;
        assert!(s1.iter().all(|n| n.name != n1.name()));
        assert!(s1.iter().any(|n| n.name == n2.name()));

        let s2 = wait_snapshot(&mut rx2, |s| !s.is_empty(), Duration::from_secs(5)).await;
        assert!(s2.iter().all(|n| n.name != n2.name()));
        assert!(s2.iter().any(|n| n.name == n1.name()));

        n2.leave().await;
        n1.leave().await;
    }

    #[tokio::test]
    async fn peer_metadata_in_snapshots_decodes_to_the_descriptor() {
        let key = vec![7u8; KEY_LEN];
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        let n1 = Cluster::new(test_config("wg0", d1.path(), Some(key.clone())))
            .await
            .unwrap();
        let n2 = Cluster::new(test_config("wg0", d2.path(), Some(key)))
            .await
            .unwrap();

        n1.update(descriptor(&n1)).await.unwrap();
        n2.update(descriptor(&n2)).await.unwrap();
        let mut rx2 = n2.members().unwrap();
        n2.join(&[n1.advertise_addr().to_string()]).await.unwrap();

        let n1_name = n1.name().to_string();
        let snapshot = wait_snapshot(
            &mut rx2,
            |s| s.iter().any(|n| n.name == n1_name && !n.meta.is_empty()),
            Duration::from_secs(5),
        )
        .await;

        let mut peer = snapshot
            .into_iter()
            .find(|n| n.name == n1_name)
            .expect("peer missing from snapshot");
        peer.decode_meta().unwrap();
        assert_eq!(peer.pub_key, format!("pubkey-of-{n1_name}"));

        n2.leave().await;
        n1.leave().await;
    }

    #[test]
    fn one_corrupt_peer_does_not_poison_the_batch() {
        // the usable-descriptor set is the consumer-side projection of a
        // snapshot: decode what decodes, skip what does not
        let mut good = Node::new("good", "10.0.0.1:7946".parse().unwrap());
        good.pub_key = "good-key".to_string();
        good.meta = good.encode_meta(crate::common::META_LIMIT).unwrap();

        let mut bad = Node::new("bad", "10.0.0.2:7946".parse().unwrap());
        bad.meta = vec![0xfe; 64];

        let snapshot = vec![good, bad];
        let usable: Vec<Node> = snapshot
            .into_iter()
            .filter_map(|mut node| node.decode_meta().ok().map(|_| node))
            .collect();

        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].name, "good");
        assert_eq!(usable[0].pub_key, "good-key");
    }

    // ============================================================
    // PERSISTENCE
    // ============================================================

    #[tokio::test]
    async fn leave_persists_the_last_snapshot_first() {
        let key = vec![8u8; KEY_LEN];
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        let n1 = Cluster::new(test_config("wg0", d1.path(), Some(key.clone())))
            .await
            .unwrap();
        let n2 = Cluster::new(test_config("wg0", d2.path(), Some(key)))
            .await
            .unwrap();

        n1.update(descriptor(&n1)).await.unwrap();
        n2.update(descriptor(&n2)).await.unwrap();
        let mut rx2 = n2.members().unwrap();
        n2.join(&[n1.advertise_addr().to_string()]).await.unwrap();
        wait_snapshot(&mut rx2, |s| !s.is_empty(), Duration::from_secs(5)).await;

        n2.leave().await;

        let persisted = ClusterState::load(d2.path(), "wg0");
        assert!(
            persisted
                .nodes
                .iter()
                .any(|n| n.addr == n1.advertise_addr()),
            "peer list was not durable after leave"
        );

        n1.leave().await;
    }

    // ============================================================
    // END-TO-END CONVERGENCE
    // ============================================================

    #[tokio::test]
    async fn three_instances_converge_including_cold_start_rejoin() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let key = vec![42u8; KEY_LEN];
        let d1 = tempfile::tempdir()?;
        let d2 = tempfile::tempdir()?;
        let d3 = tempfile::tempdir()?;

        // instance 1 forms a one-node cluster
        let n1 = Cluster::new(test_config("wg0", d1.path(), Some(key.clone()))).await?;
        n1.update(descriptor(&n1)).await?;
        let mut rx1 = n1.members()?;
        n1.join(&[]).await?;

        // instance 2 joins instance 1 by address
        let n2 = Cluster::new(test_config("wg0", d2.path(), Some(key.clone()))).await?;
        n2.update(descriptor(&n2)).await?;
        let mut rx2 = n2.members()?;
        n2.join(&[n1.advertise_addr().to_string()]).await?;

        wait_snapshot(&mut rx1, |s| s.len() == 1, Duration::from_secs(5)).await;
        wait_snapshot(&mut rx2, |s| s.len() == 1, Duration::from_secs(5)).await;

        // instance 3 knows nobody explicitly but has both peers persisted
        let mut seeded = ClusterState::default();
        seeded.nodes.push(Node::new("peer-1", n1.advertise_addr()));
        seeded.nodes.push(Node::new("peer-2", n2.advertise_addr()));
        seeded.save(d3.path(), "wg0")?;

        let n3 = Cluster::new(test_config("wg0", d3.path(), Some(key))).await?;
        n3.update(descriptor(&n3)).await?;
        let mut rx3 = n3.members()?;
        n3.join(&[]).await?; // cold-start rejoin from state

        let s3 = wait_snapshot(&mut rx3, |s| s.len() == 2, Duration::from_secs(10)).await;
        let names: Vec<&str> = s3.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&n1.name()));
        assert!(names.contains(&n2.name()));

        wait_snapshot(&mut rx1, |s| s.len() == 2, Duration::from_secs(10)).await;
        wait_snapshot(&mut rx2, |s| s.len() == 2, Duration::from_secs(10)).await;

        n3.leave().await;
        n2.leave().await;
        n1.leave().await;
        Ok(())
    }
}
