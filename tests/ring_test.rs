use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chord_dht::node_info::NodeInfo;
use chord_dht::{ChordConfig, ChordError, ChordNetwork, Identifier};

fn config(bits: u32, tolerance: usize) -> ChordConfig {
    ChordConfig {
        tolerance,
        ..ChordConfig::with_bits(bits)
    }
}

// Joins every id through the first one, running a few maintenance passes
// after each join.
fn build_ring(config: ChordConfig, ids: &[Identifier]) -> Arc<ChordNetwork> {
    let network = ChordNetwork::new(config).unwrap();
    network.create_node(ids[0]).unwrap().join(None).unwrap();
    for id in &ids[1..] {
        network.create_node(*id).unwrap().join(Some(ids[0])).unwrap();
        settle(&network, 3);
    }
    settle(&network, 3);
    network
}

fn settle(network: &ChordNetwork, rounds: usize) {
    for _ in 0..rounds {
        network.stabilize_all_once();
    }
}

fn snapshot(network: &ChordNetwork, id: Identifier) -> NodeInfo {
    network.node(id).unwrap().routing_snapshot()
}

fn owner_of(ids: &[Identifier], key: Identifier) -> Identifier {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .copied()
        .find(|id| *id >= key)
        .unwrap_or(sorted[0])
}

const RING: [Identifier; 7] = [10, 40, 75, 120, 160, 200, 230];

#[test]
fn three_node_ring_links_up() {
    let network = build_ring(config(3, 0), &[2, 5]);
    network.create_node(7).unwrap().join(Some(2)).unwrap();
    settle(&network, 4);

    assert_eq!(snapshot(&network, 2).successor_info_list, vec![5]);
    assert_eq!(snapshot(&network, 5).successor_info_list, vec![7]);
    assert_eq!(snapshot(&network, 7).successor_info_list, vec![2]);
    assert_eq!(snapshot(&network, 2).predecessor_info, Some(7));
    assert_eq!(snapshot(&network, 5).predecessor_info, Some(2));
    assert_eq!(snapshot(&network, 7).predecessor_info, Some(5));
    assert!(network.check_ring_connectivity());
}

#[test]
fn three_node_ring_with_longer_lists() {
    let network = build_ring(config(3, 1), &[2, 5, 7]);
    assert_eq!(snapshot(&network, 2).successor_info_list, vec![5, 7]);
    assert_eq!(snapshot(&network, 5).successor_info_list, vec![7, 2]);
    assert_eq!(snapshot(&network, 7).successor_info_list, vec![2, 5]);
}

#[test]
fn stored_value_survives_owner_kill() {
    let network = ChordNetwork::new(ChordConfig {
        failure_timeout_ms: 0,
        failure_threshold: 1,
        ..config(3, 1)
    })
    .unwrap();
    network.create_node(2).unwrap().join(None).unwrap();
    for id in [5, 7] {
        network.create_node(id).unwrap().join(Some(2)).unwrap();
        settle(&network, 3);
    }

    network.node(5).unwrap().store(6, b"x".to_vec()).unwrap();
    assert_eq!(network.node(7).unwrap().local_value(6), Some(b"x".to_vec()));
    assert_eq!(network.node(2).unwrap().local_value(6), Some(b"x".to_vec()));
    assert_eq!(network.node(5).unwrap().local_value(6), None);

    network.node(7).unwrap().kill();
    settle(&network, 4);

    let two = network.node(2).unwrap();
    let five = network.node(5).unwrap();
    assert_eq!(two.local_value(6), Some(b"x".to_vec()));
    assert_eq!(two.retrieve(6), Ok(Some(b"x".to_vec())));
    assert_eq!(five.retrieve(6), Ok(Some(b"x".to_vec())));
    assert_eq!(five.find_successor(6), Ok(2));
    assert_eq!(snapshot(&network, 5).successor_info_list, vec![2]);
    assert_eq!(snapshot(&network, 2).predecessor_info, Some(5));
    // re-replicated to the new successor of the owner
    assert_eq!(five.local_value(6), Some(b"x".to_vec()));
    assert!(network.check_ring_connectivity());
}

#[test]
fn ring_converges_and_routes_every_key() {
    let network = build_ring(config(8, 2), &RING);
    assert!(network.check_ring_connectivity());

    let mut sorted = RING.to_vec();
    sorted.sort_unstable();
    for (idx, id) in sorted.iter().enumerate() {
        let info = snapshot(&network, *id);
        let expected: Vec<Identifier> = (1..=3).map(|k| sorted[(idx + k) % sorted.len()]).collect();
        assert_eq!(info.successor_info_list, expected, "successors of {}", id);
        assert_eq!(
            info.predecessor_info,
            Some(sorted[(idx + sorted.len() - 1) % sorted.len()])
        );
    }

    for id in RING {
        let node = network.node(id).unwrap();
        for key in 0..256u64 {
            assert_eq!(node.find_successor(key), Ok(owner_of(&RING, key)), "key {} from {}", key, id);
        }
    }
}

#[test]
fn fingers_point_at_interval_owners() {
    let network = build_ring(config(8, 2), &RING);
    let space = network.space();
    for id in RING {
        let info = snapshot(&network, id);
        for (i, finger) in info.finger_table.iter().enumerate() {
            let start = space.add_pow2(id, i as u32);
            assert_eq!(*finger, owner_of(&RING, start), "finger {} of {}", i, id);
        }
    }
}

#[test]
fn extra_round_on_stable_ring_changes_nothing() {
    let network = build_ring(config(8, 2), &RING);
    let before: Vec<NodeInfo> = RING.iter().map(|id| snapshot(&network, *id)).collect();
    settle(&network, 2);
    let after: Vec<NodeInfo> = RING.iter().map(|id| snapshot(&network, *id)).collect();
    assert_eq!(before, after);
}

#[test]
fn late_join_takes_over_its_range() {
    let network = build_ring(config(8, 1), &[10, 120, 200]);
    let entry = network.node(10).unwrap();
    for key in [50u64, 90, 110, 150] {
        entry.store(key, key.to_string().into_bytes()).unwrap();
    }

    network.create_node(100).unwrap().join(Some(200)).unwrap();
    settle(&network, 4);

    let joined = network.node(100).unwrap();
    assert_eq!(joined.local_value(50), Some(b"50".to_vec()));
    assert_eq!(joined.local_value(90), Some(b"90".to_vec()));
    assert_eq!(joined.local_value(110), None);
    // 120 keeps 50 and 90 as the single replica of 100
    let old_owner = network.node(120).unwrap();
    assert_eq!(old_owner.local_value(90), Some(b"90".to_vec()));
    // 200 held replicas of 120's range and is no longer among 100's replicas
    assert_eq!(network.node(200).unwrap().local_value(50), None);

    for key in [50u64, 90, 110, 150] {
        assert_eq!(entry.retrieve(key), Ok(Some(key.to_string().into_bytes())));
    }
    assert_eq!(entry.find_successor(80), Ok(100));
}

#[test]
fn every_key_is_replicated_after_store() {
    let network = build_ring(config(8, 2), &RING);
    let entry = network.node(160).unwrap();
    let keys: Vec<Identifier> = (0..256u64).step_by(13).collect();
    for key in &keys {
        entry.store(*key, vec![*key as u8]).unwrap();
    }
    settle(&network, 1);

    let mut sorted = RING.to_vec();
    sorted.sort_unstable();
    for key in keys {
        let owner = owner_of(&RING, key);
        let pos = sorted.iter().position(|id| *id == owner).unwrap();
        for k in 0..3 {
            let holder = sorted[(pos + k) % sorted.len()];
            assert_eq!(
                network.node(holder).unwrap().local_value(key),
                Some(vec![key as u8]),
                "key {} on {}",
                key,
                holder
            );
        }
    }
}

#[test]
fn data_survives_crash_of_owner() {
    let network = build_ring(
        ChordConfig {
            failure_timeout_ms: 0,
            failure_threshold: 2,
            ..config(8, 2)
        },
        &RING,
    );
    let entry = network.node(10).unwrap();
    let keys: Vec<Identifier> = (41..=75).collect();
    for key in &keys {
        entry.store(*key, b"payload".to_vec()).unwrap();
    }

    network.node(75).unwrap().crash();
    settle(&network, 5);

    let survivors: Vec<Identifier> = RING.iter().copied().filter(|id| *id != 75).collect();
    assert!(network.check_ring_connectivity());
    for key in &keys {
        assert_eq!(entry.find_successor(*key), Ok(120));
        assert_eq!(entry.retrieve(*key), Ok(Some(b"payload".to_vec())));
        assert_eq!(network.node(120).unwrap().local_value(*key), Some(b"payload".to_vec()));
    }
    for id in &survivors {
        let info = snapshot(&network, *id);
        assert!(!info.successor_info_list.contains(&75));
        assert!(!info.finger_table.contains(&75));
        assert_ne!(info.predecessor_info, Some(75));
    }
}

#[test]
fn lookup_walk_beyond_budget_is_exhausted() {
    let network = build_ring(
        ChordConfig {
            max_lookup_hops: Some(2),
            ..config(3, 1)
        },
        &[2, 5, 7],
    );
    let node = network.node(2).unwrap();
    let mut visited: HashSet<Identifier> = [0u64, 1, 3].into_iter().collect();
    assert_eq!(
        chord_dht::router::find_successor_with_visited(&node, 6, &mut visited),
        Err(ChordError::LookupExhausted { key: 6, hops: 3 })
    );
    assert_eq!(node.find_successor(6), Ok(7));
}

#[test]
fn join_through_dead_bootstrap_fails() {
    let network = build_ring(config(4, 1), &[3]);
    network.node(3).unwrap().crash();
    let node = network.create_node(9).unwrap();
    assert!(matches!(
        node.join(Some(3)),
        Err(ChordError::JoinFailed { bootstrap: 3, .. })
    ));
    assert_eq!(node.routing_snapshot(), NodeInfo::new(9, &network.space()));
}

#[test]
fn calls_on_dead_node_fail() {
    let network = build_ring(config(4, 1), &[3, 9]);
    let node = network.node(9).unwrap();
    node.kill();
    assert!(!node.is_alive());
    assert_eq!(node.find_successor(1), Err(ChordError::NodeDead(9)));
    assert_eq!(node.retrieve(1), Err(ChordError::NodeDead(9)));
    assert_eq!(node.check_failures(), Err(ChordError::NodeDead(9)));
    assert_eq!(node.fix_finger_table(), Err(ChordError::NodeDead(9)));
    assert_eq!(node.check_predecessor(), Err(ChordError::NodeDead(9)));
}

#[test]
fn background_workers_converge_and_stop() {
    let network = ChordNetwork::new(ChordConfig {
        stabilize_interval_ms: 5,
        fix_fingers_interval_ms: 5,
        failure_check_interval_ms: 10,
        failure_timeout_ms: 20,
        failure_threshold: 2,
        ..config(6, 1)
    })
    .unwrap();
    let ids: [Identifier; 4] = [3, 17, 33, 50];
    network.create_node(ids[0]).unwrap().join(None).unwrap();
    for id in &ids[1..] {
        network.create_node(*id).unwrap().join(Some(ids[0])).unwrap();
    }
    for node in network.alive_nodes() {
        node.start_maintenance().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let converged = |network: &ChordNetwork| {
        network.check_ring_connectivity()
            && ids.iter().enumerate().all(|(idx, id)| {
                let pred = ids[(idx + ids.len() - 1) % ids.len()];
                snapshot(network, *id).predecessor_info == Some(pred)
            })
    };
    while !converged(network.as_ref()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(converged(network.as_ref()));

    network.shutdown();
    let frozen: Vec<NodeInfo> = ids.iter().map(|id| snapshot(&network, *id)).collect();
    thread::sleep(Duration::from_millis(50));
    let later: Vec<NodeInfo> = ids.iter().map(|id| snapshot(&network, *id)).collect();
    assert_eq!(frozen, later);
}

#[test]
fn deleted_key_stays_deleted_after_join() {
    let network = build_ring(config(8, 1), &[10, 120, 200]);
    let entry = network.node(10).unwrap();
    entry.store(90, b"v".to_vec()).unwrap();

    network.create_node(150).unwrap().join(Some(10)).unwrap();
    network.node(120).unwrap().stabilize().unwrap();
    // 200 still holds its old replica of 90
    assert_eq!(network.node(200).unwrap().local_value(90), Some(b"v".to_vec()));

    assert_eq!(entry.delete(90), Ok(Some(b"v".to_vec())));
    assert_eq!(entry.retrieve(90), Ok(None));

    // 200 hands the stale copy back to 120 while rebalancing
    settle(&network, 3);
    assert_eq!(entry.retrieve(90), Ok(None));
    for id in [10, 120, 150, 200] {
        assert_eq!(network.node(id).unwrap().local_value(90), None, "node {}", id);
    }
}
