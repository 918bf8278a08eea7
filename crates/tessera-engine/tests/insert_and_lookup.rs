//! Insert quorum and whole-object lookup across a simulated ring.

mod common;

use assert_matches::assert_matches;
use common::{expires_in, placed_object};
use tessera_core::{EngineConfig, ObjectPolicy, TesseraError, VersionKey, MINUTES, SECONDS};
use tessera_engine::{Body, Envelope, MessageTag, OpId};
use tessera_testkit::{init_tracing, small_config, ReferencePolicy, SimNetwork};

#[test]
fn insert_places_each_fragment_at_its_location() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(1, 300);
    let expiration = expires_in(&network, 60 * MINUTES);

    let receipts = network.insert(nodes[0], object.clone(), expiration).unwrap();
    assert!(receipts >= 3, "quorum is ceil(2 * 1.5) = 3, got {receipts}");
    network.run_until_quiet();

    let holders = network.holders(&object.key);
    for index in 0..4u32 {
        let node = nodes[index as usize];
        assert_eq!(holders.get(&index), Some(&vec![node]), "fragment {index}");
        let metadata = network
            .engine(node)
            .store()
            .metadata(&object.key.fragment(index))
            .unwrap();
        assert_eq!(metadata.current_expiration, expiration);
        assert_eq!(metadata.previous_expiration, 0);
    }
}

#[test]
fn lookup_is_repeatable_from_every_node() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(2, 1_000);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[1], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    for node in &nodes {
        for _ in 0..2 {
            let found = network.lookup(*node, object.key).unwrap();
            assert_eq!(found, object);
        }
    }
    // Lookups never change what is stored
    assert_eq!(network.fragment_count(&object.key), 4);
}

#[test]
fn lookup_tolerates_lost_holders() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(3, 64);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.insert(nodes[0], object.clone(), expiration).unwrap();
    network.run_until_quiet();

    network.kill(nodes[1]);
    network.kill(nodes[2]);
    assert_eq!(network.lookup(nodes[0], object.key).unwrap(), object);
    assert_eq!(network.lookup(nodes[3], object.key).unwrap(), object);
}

#[test]
fn insert_without_enough_authoritative_holders_fails() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    // Survivors still claim their old ranges, so the dead nodes' locations
    // get only non-authoritative answers and nothing is pushed
    network.kill(nodes[2]);
    network.kill(nodes[3]);
    let object = placed_object(4, 64);
    let expiration = expires_in(&network, 60 * MINUTES);

    let result = network.insert(nodes[0], object.clone(), expiration);
    assert_matches!(
        result,
        Err(TesseraError::NotEnoughReceipts {
            received: 0,
            required: 3,
            ..
        })
    );
    assert_eq!(network.fragment_count(&object.key), 0);
}

#[test]
fn late_query_answer_still_receives_its_fragment() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let (via, late) = (nodes[0], nodes[3]);
    let object = placed_object(8, 200);
    let expiration = expires_in(&network, 60 * MINUTES);

    network.hold_where(move |target, envelope| {
        target == via && envelope.source == late && envelope.body.name() == "query-response"
    });
    let receipts = network.insert(via, object.clone(), expiration).unwrap();
    assert_eq!(receipts, 3);
    assert_eq!(network.holders(&object.key).get(&3), None);

    network.advance(100);
    assert_eq!(network.release_held(), 1);
    network.run_until_quiet();

    let holders = network.holders(&object.key);
    for index in 0..4u32 {
        assert_eq!(holders.get(&index), Some(&vec![nodes[index as usize]]), "fragment {index}");
    }
    let receipt = network
        .traffic()
        .iter()
        .any(|d| d.target == via && d.source == late && d.body == "receipt");
    assert!(receipt, "late holder acknowledged its fragment");
}

#[test]
fn quorum_beyond_the_fragment_count_never_pushes() {
    init_tracing();
    let config = EngineConfig {
        num_fragments: 4,
        num_survivors: 2,
        min_fragments_after_insert: 3.0,
        ..small_config()
    };
    let mut network = SimNetwork::ring(config, 4);
    let nodes = network.nodes();
    let object = placed_object(9, 100);
    let expiration = expires_in(&network, 60 * MINUTES);
    network.clear_traffic();

    let started = network.now();
    let result = network.insert(nodes[0], object.clone(), expiration);
    assert_matches!(
        result,
        Err(TesseraError::NotEnoughReceipts {
            received: 0,
            required: 6,
            ..
        })
    );
    // Every location answered, but four holders never reach six
    let answers = network
        .traffic()
        .iter()
        .filter(|d| d.target == nodes[0] && d.body == "query-response")
        .count();
    assert!((1..6).contains(&answers), "{answers} query answers");
    assert!(network.traffic().iter().all(|d| d.body != "data"));
    assert_eq!(network.fragment_count(&object.key), 0);
    assert!(network.now() - started >= 2 * SECONDS);
}

#[test]
fn insert_rejects_past_expiration() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(5, 16);
    let now = network.now();
    assert_matches!(
        network.insert(nodes[0], object, now),
        Err(TesseraError::Invalid { .. })
    );
}

#[test]
fn lookup_of_unknown_object_runs_out_of_fragments() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let key = VersionKey::new(placed_object(6, 1).key.id, 3);
    let started = network.now();

    let result = network.lookup(nodes[2], key);
    assert_matches!(result, Err(TesseraError::NotEnoughFragments { found: 0, checked: 4, .. }));
    let elapsed = network.now() - started;
    assert!(elapsed <= 10 * SECONDS, "gave up after {elapsed} ms");
}

#[test]
fn forged_and_corrupted_fragments_are_not_stored() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(7, 128);
    let expiration = expires_in(&network, 60 * MINUTES);
    let target = nodes[1];
    let key = object.key.fragment(1);

    let item = |policy: &ReferencePolicy, corrupt: bool| {
        let mut fragments = policy.encode(&object, 4, 2).unwrap();
        let manifests = policy.create_manifests(&object, &fragments, expiration).unwrap();
        if corrupt {
            fragments[1].payload[0] ^= 0xff;
        }
        tessera_engine::message::DataItem {
            key,
            fragment: Some(fragments[1].clone()),
            manifest: manifests[1].clone(),
        }
    };
    let push = |items| Envelope::new(OpId(999), nodes[0], MessageTag::Insert, Body::Data { items });

    let rogue = ReferencePolicy::new(99);
    network.engine_mut(target).deliver(push(vec![item(&rogue, false)]));
    assert!(!network.engine(target).store().contains(&key));

    let genuine = network.policy().clone();
    network.engine_mut(target).deliver(push(vec![item(&genuine, true)]));
    assert!(!network.engine(target).store().contains(&key));

    network.engine_mut(target).deliver(push(vec![item(&genuine, false)]));
    assert!(network.engine(target).store().contains(&key));

    // The node responsible elsewhere refuses to store it at all
    network.engine_mut(nodes[3]).deliver(push(vec![item(&genuine, false)]));
    assert!(!network.engine(nodes[3]).store().contains(&key));
}
