//! Simple and bulk expiration refresh.

mod common;

use assert_matches::assert_matches;
use common::{expires_in, placed_object};
use tessera_core::{NodeId, TesseraError, VersionKey, MINUTES, SECONDS};
use tessera_engine::Body;
use tessera_testkit::{init_tracing, small_config, SimNetwork};

fn assert_expiration(network: &SimNetwork, key: &VersionKey, current: u64, previous: u64) {
    let holders = network.holders(key);
    assert_eq!(holders.len(), 4, "every fragment of {key} is held");
    for (index, nodes) in holders {
        for node in nodes {
            let metadata = network
                .engine(node)
                .store()
                .metadata(&key.fragment(index))
                .unwrap();
            assert_eq!(metadata.current_expiration, current, "{key}#{index} at {node}");
            assert_eq!(metadata.previous_expiration, previous, "{key}#{index} at {node}");
        }
    }
}

/// A node holding no fragment of `key`.
fn bystander(network: &SimNetwork, key: &VersionKey) -> NodeId {
    let holders: Vec<NodeId> = network.holders(key).into_values().flatten().collect();
    network
        .nodes()
        .into_iter()
        .find(|node| !holders.contains(node))
        .unwrap()
}

#[test]
fn refresh_through_a_holder_extends_every_fragment() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(30, 120);
    let first = expires_in(&network, 10 * MINUTES);
    network.insert(nodes[0], object.clone(), first).unwrap();
    network.run_until_quiet();

    let second = first + 50 * MINUTES;
    let pending = network.engine_mut(nodes[0]).refresh(vec![(object.key, second)]);
    let outcome = network.settle(pending, 10 * SECONDS).unwrap();

    assert_eq!(outcome.len(), 1);
    assert_matches!(outcome[0], (key, Ok(())) if key == object.key);
    network.run_until_quiet();
    assert_expiration(&network, &object.key, second, first);

    // The refreshed manifests still restore the object
    assert_eq!(network.lookup(nodes[2], object.key).unwrap(), object);
}

#[test]
fn refresh_through_a_bystander_fetches_the_manifest() {
    init_tracing();
    let mut network = SimNetwork::ring(small_config(), 8);
    let nodes = network.nodes();
    let object = placed_object(31, 120);
    let first = expires_in(&network, 10 * MINUTES);
    network.insert(nodes[0], object.clone(), first).unwrap();
    network.run_until_quiet();

    let via = bystander(&network, &object.key);
    let second = first + 5 * MINUTES;
    let pending = network.engine_mut(via).refresh(vec![(object.key, second)]);
    let outcome = network.settle(pending, 10 * SECONDS).unwrap();

    assert_matches!(outcome[0], (_, Ok(())));
    network.run_until_quiet();
    assert_expiration(&network, &object.key, second, first);
}

#[test]
fn refresh_reports_each_object_separately() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let object = placed_object(32, 40);
    let first = expires_in(&network, 10 * MINUTES);
    network.insert(nodes[0], object.clone(), first).unwrap();
    network.run_until_quiet();

    let unknown = VersionKey::new(object.key.id, 9);
    let now = network.now();
    let pending = network.engine_mut(nodes[1]).refresh(vec![
        (unknown, first),
        (object.key, now),
    ]);
    let outcome = network.settle(pending, 20 * SECONDS).unwrap();

    assert_eq!(outcome.len(), 2);
    assert_matches!(&outcome[0], (key, Err(TesseraError::ManifestUnavailable { .. })) if *key == unknown);
    assert_matches!(&outcome[1], (_, Err(TesseraError::Invalid { .. })));
    assert_expiration(&network, &object.key, first, 0);
}

#[test]
fn bulk_refresh_patches_every_holder() {
    init_tracing();
    let mut config = small_config();
    config.bulk_refresh_probe_max_attempts = 10;
    let mut network = SimNetwork::ring(config, 8);
    let nodes = network.nodes();
    let first = expires_in(&network, 10 * MINUTES);
    let objects: Vec<_> = (0..3).map(|seq| placed_object(40 + seq, 90)).collect();
    for object in &objects {
        network.insert(nodes[0], object.clone(), first).unwrap();
    }
    network.run_until_quiet();

    let unknown = VersionKey::new(objects[0].key.id, 4);
    let second = first + 20 * MINUTES;
    let mut requests: Vec<_> = objects.iter().map(|o| (o.key, second)).collect();
    requests.push((unknown, second));

    let via = bystander(&network, &objects[0].key);
    let pending = network.engine_mut(via).refresh(requests);
    let outcome = network.settle(pending, MINUTES).unwrap();

    assert_eq!(outcome.len(), 4);
    for (object, (key, result)) in objects.iter().zip(&outcome) {
        assert_eq!(*key, object.key);
        assert!(result.is_ok(), "{key}: {result:?}");
    }
    assert_matches!(&outcome[3], (_, Err(TesseraError::ManifestUnavailable { .. })));

    network.run_until_quiet();
    for object in &objects {
        assert_expiration(&network, &object.key, second, first);
    }
}

#[test]
fn bulk_refresh_counts_only_live_holders() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let first = expires_in(&network, 10 * MINUTES);
    let objects: Vec<_> = (0..3).map(|seq| placed_object(50 + seq, 60)).collect();
    for object in &objects {
        network.insert(nodes[0], object.clone(), first).unwrap();
    }
    network.run_until_quiet();

    // Two holders gone: at most two acknowledgements per object, one short
    // of the quorum
    network.kill(nodes[2]);
    network.kill(nodes[3]);
    let requests = objects.iter().map(|o| (o.key, first + MINUTES)).collect();
    let pending = network.engine_mut(nodes[0]).refresh(requests);
    let outcome = network.settle(pending, MINUTES).unwrap();

    for (_, result) in &outcome {
        assert_matches!(result, Err(TesseraError::NotEnoughReceipts { received: 2, required: 3, .. }));
    }
}

#[test]
fn inflated_patch_ack_still_counts_toward_the_quorum() {
    init_tracing();
    let mut network = SimNetwork::small();
    let nodes = network.nodes();
    let first = expires_in(&network, 10 * MINUTES);
    let objects: Vec<_> = (0..3).map(|seq| placed_object(60 + seq, 60)).collect();
    for object in &objects {
        network.insert(nodes[0], object.clone(), first).unwrap();
    }
    network.run_until_quiet();

    // Same ring as above: two live holders, one fragment each
    network.kill(nodes[2]);
    network.kill(nodes[3]);
    let (via, peer) = (nodes[0], nodes[1]);
    network.hold_where(move |target, envelope| {
        target == via && envelope.source == peer && envelope.body.name() == "patch-ack"
    });
    let requests = objects.iter().map(|o| (o.key, first + MINUTES)).collect();
    let pending = network.engine_mut(via).refresh(requests);
    for _ in 0..100 {
        if network.held() > 0 {
            break;
        }
        network.advance(100);
    }

    let mut held = network.take_held();
    assert_eq!(held.len(), 1);
    let (target, mut ack) = held.remove(0);
    assert_eq!(target, via);
    match &mut ack.body {
        Body::PatchAck { counts } => {
            assert_eq!(counts.len(), 3);
            for (_, count) in counts.iter_mut() {
                assert_eq!(*count, 1);
                *count = 3;
            }
        }
        other => panic!("held {}", other.name()),
    }
    network.engine_mut(via).deliver(ack);
    let outcome = network.settle(pending, MINUTES).unwrap();

    // 1 from the local holder plus 3 claimed by a peer holding a single fragment
    for (key, result) in &outcome {
        assert!(result.is_ok(), "{key}: {result:?}");
    }
}
