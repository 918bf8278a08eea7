//! Repair, anti-entropy, handoff and garbage collection over simulated time.

mod common;

use common::{expires_in, placed_object};
use tessera_core::{EngineConfig, Placement, RingId, MINUTES, SECONDS};
use tessera_engine::{MaintenanceTask, MessageTag};
use tessera_testkit::{init_tracing, small_config, SimNetwork};

#[test]
fn lost_fragment_is_regenerated_by_its_new_owner() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(10, 500);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    network.kill(nodes[1]);
    assert_eq!(network.fragment_count(&object.key), 3);

    // Neighbor timeout, then a local scan on the node that inherits the
    // dead node's range, then the repair itself
    network.advance(40 * SECONDS);

    let holders = network.holders(&object.key);
    assert_eq!(holders.get(&1), Some(&vec![nodes[2]]));
    assert_eq!(network.fragment_count(&object.key), 4);
    let repaired = network
        .engine(nodes[2])
        .store()
        .metadata(&object.key.fragment(1))
        .unwrap();
    assert_eq!(repaired.current_expiration, expiration);

    // The home node was asked for the fragment itself before any restore
    let direct = network
        .traffic()
        .iter()
        .any(|d| d.source == nodes[2] && d.tag == MessageTag::Fetch && d.body == "fetch");
    assert!(direct);

    assert_eq!(network.lookup(nodes[3], object.key).unwrap(), object);
}

#[test]
fn two_lost_holders_are_both_regenerated() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(15, 700);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    // Exactly K fragments survive
    network.kill(nodes[1]);
    network.kill(nodes[2]);
    assert_eq!(network.fragment_count(&object.key), 2);

    network.advance(60 * SECONDS);

    let holders = network.holders(&object.key);
    assert_eq!(holders.get(&1), Some(&vec![nodes[0]]));
    assert_eq!(holders.get(&2), Some(&vec![nodes[3]]));
    assert_eq!(network.fragment_count(&object.key), 4);
    assert_eq!(network.lookup(nodes[3], object.key).unwrap(), object);
}

#[test]
fn repair_fetches_are_paid_from_the_traffic_bucket() {
    init_tracing();
    // Two tokens and no refill: one for releasing the job, one for the
    // direct fetch, none left for the restore that follows
    let config = EngineConfig {
        token_bucket_capacity: 2,
        token_bucket_tokens_per_second: 0,
        ..small_config()
    };
    let mut network = SimNetwork::ring(config, 4);
    let nodes = network.nodes();
    let object = placed_object(16, 500);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    network.kill(nodes[1]);
    network.advance(40 * SECONDS);

    assert_eq!(network.fragment_count(&object.key), 3);
    assert!(!network.engine(nodes[2]).store().contains(&object.key.fragment(1)));
    assert_eq!(network.engine_mut(nodes[2]).statistics().bucket_tokens, 0);
}

#[test]
fn anti_entropy_restores_a_fragment_missed_at_insert() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(11, 200);
    let expiration = expires_in(&network, 60 * MINUTES);
    let absent = nodes[2];

    network.drop_where(move |target, _| target == absent);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();
    network.heal();
    assert!(!network.engine(absent).store().contains(&object.key.fragment(2)));

    network.advance(40 * SECONDS);

    assert!(network.engine(absent).store().contains(&object.key.fragment(2)));
    assert_eq!(network.fragment_count(&object.key), 4);
}

#[test]
fn joining_node_receives_fragments_in_its_range() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(12, 200);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    // Right next to fragment 3's location
    let location = Placement::new(4).location(object.key.id, 3, object.key.version);
    let newcomer = location.add(RingId(1_000));
    network.add_node(newcomer);
    network.advance(SECONDS);

    let key = object.key.fragment(3);
    assert!(network.engine(newcomer).store().contains(&key));
    assert!(!network.engine(nodes[3]).store().contains(&key));
    assert_eq!(network.holders(&object.key).get(&3), Some(&vec![newcomer]));

    assert_eq!(network.lookup(nodes[3], object.key).unwrap(), object);
}

#[test]
fn expired_fragments_are_collected_strictly_after_expiration() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(13, 50);
    // Garbage collection runs every five seconds from the start
    let expiration = expires_in(&network, 10 * SECONDS);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    network.advance(10 * SECONDS);
    assert_eq!(network.now(), expiration);
    assert_eq!(network.fragment_count(&object.key), 4);

    network.advance(5 * SECONDS);
    assert_eq!(network.fragment_count(&object.key), 0);
}

#[test]
fn nudged_local_scan_runs_before_its_period() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(14, 80);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    // An orderly departure shifts ranges at once
    network.depart(nodes[1]);
    network.engine_mut(nodes[2]).nudge(MaintenanceTask::LocalScan);
    network.advance(3 * SECONDS);

    assert_eq!(network.holders(&object.key).get(&1), Some(&vec![nodes[2]]));
}

#[test]
fn long_run_with_churn_keeps_every_deadline_contract() {
    init_tracing();
    let mut network = SimNetwork::ring(tessera_testkit::small_config(), 6);
    let nodes = network.nodes();
    let mut keys = Vec::new();
    for seq in 0..5 {
        let object = placed_object(20 + seq, 100 + seq as usize * 37);
        let expiration = expires_in(&network, (10 + seq as u64 * 10) * MINUTES);
        keys.push(object.key);
        network.insert(nodes[seq as usize], object, expiration).unwrap();
    }

    // `tick_all` panics on any engine fault
    network.advance(30 * SECONDS);
    network.kill(nodes[4]);
    network.advance(60 * SECONDS);
    network.add_node(RingId(nodes[4].0 + 77));
    network.advance(2 * MINUTES);

    for key in keys {
        assert!(network.fragment_count(&key) >= 2, "{key} lost too many fragments");
    }
}
