//! End-to-end tests of the public node API over loopback UDP.

use std::time::Duration;

use kelpie::{Contact, DhtError, FindValueResult, Keypair, Node, NodeId};
use tokio::time::sleep;

const TTL: Duration = Duration::from_secs(3600);

async fn spawn_node(k: usize) -> Node {
    Node::builder()
        .listen("127.0.0.1:0".parse().unwrap())
        .k(k)
        .build()
        .await
        .expect("node builds")
}

/// A founder plus `extra` joiners, all bootstrapped through the founder.
async fn spawn_network(k: usize, extra: usize) -> Vec<Node> {
    let founder = spawn_node(k).await;
    founder.join(vec![founder.contact()]).await.unwrap();
    let mut nodes = vec![founder];
    for _ in 0..extra {
        let node = spawn_node(k).await;
        node.join(vec![nodes[0].contact()]).await.unwrap();
        nodes.push(node);
    }
    // Let validation settle: the founder must know every joiner before
    // the test proper, or early lookups see a partial mesh.
    wait_until(|| nodes[0].known_contacts() >= extra).await;
    wait_until(|| nodes.iter().all(|n| n.known_contacts() >= 1)).await;
    nodes
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn shutdown_all(nodes: Vec<Node>) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let founder = spawn_node(8).await;
    founder.join(vec![founder.contact()]).await.unwrap();
    let joiner = spawn_node(8).await;
    joiner.join(vec![founder.contact()]).await.unwrap();

    assert!(joiner.joined());
    assert!(joiner.known_contacts() >= 1);

    // The founder learns the joiner from the join traffic.
    let founder_clone = founder.clone();
    assert!(wait_until(move || founder_clone.known_contacts() >= 1).await);

    let found = joiner.get_contact(founder.node_id()).await.unwrap();
    assert_eq!(found.node_id, founder.node_id());

    shutdown_all(vec![founder, joiner]).await;
}

#[tokio::test]
async fn find_nodes_with_empty_table_returns_nothing() {
    let loner = spawn_node(8).await;
    loner.join(vec![loner.contact()]).await.unwrap();

    let result = loner.find_nodes(NodeId::random()).await.unwrap();
    assert!(result.is_empty());

    loner.shutdown().await;
}

#[tokio::test]
async fn store_then_find_value_round_trips() {
    let nodes = spawn_network(4, 4).await;
    let publisher = nodes[1].clone();

    let key = NodeId::random();
    // Before the store the key resolves to closest contacts only.
    match publisher.find_value(key).await.unwrap() {
        FindValueResult::Closest { contacts, .. } => assert!(!contacts.is_empty()),
        other => panic!("expected Closest before store, got {other:?}"),
    }

    let value = b"the-value".to_vec();
    let signature = publisher.sign(&value);
    let replicas = publisher
        .store(key, value.clone(), signature.clone(), TTL)
        .await
        .unwrap();
    assert!(replicas >= 3, "stored on {replicas} replicas");

    match publisher.find_value(key).await.unwrap() {
        FindValueResult::Found {
            values, closest, ..
        } => {
            assert_eq!(values.len(), 1);
            assert_eq!(values[0].value, value);
            assert!(closest.is_empty());
        }
        other => panic!("expected Found after store, got {other:?}"),
    }

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn delete_tombstones_the_value_across_replicas() {
    let nodes = spawn_network(4, 4).await;
    let publisher = nodes[1].clone();

    let key = NodeId::random();
    let value = b"short-lived".to_vec();
    let signature = publisher.sign(&value);
    publisher
        .store(key, value.clone(), signature.clone(), TTL)
        .await
        .unwrap();

    let removed = publisher
        .delete(key, value.clone(), signature)
        .await
        .unwrap();
    assert!(removed >= 3);

    match publisher.find_value(key).await.unwrap() {
        FindValueResult::Closest { .. } => {}
        other => panic!("expected Closest after delete, got {other:?}"),
    }

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn update_replaces_the_value() {
    let nodes = spawn_network(4, 4).await;
    let publisher = nodes[2].clone();

    let key = NodeId::random();
    let old_value = b"version-1".to_vec();
    let old_signature = publisher.sign(&old_value);
    publisher
        .store(key, old_value.clone(), old_signature.clone(), TTL)
        .await
        .unwrap();

    let new_value = b"version-2".to_vec();
    let new_signature = publisher.sign(&new_value);
    let updated = publisher
        .update(
            key,
            new_value.clone(),
            new_signature,
            old_value,
            old_signature,
            TTL,
        )
        .await
        .unwrap();
    assert!(updated >= 3);

    match publisher.find_value(key).await.unwrap() {
        FindValueResult::Found { values, .. } => {
            assert_eq!(values.len(), 1);
            assert_eq!(values[0].value, new_value);
        }
        other => panic!("expected Found after update, got {other:?}"),
    }

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn lookup_completes_despite_a_dead_peer() {
    let nodes = spawn_network(4, 4).await;
    let observer = nodes[1].clone();

    // Make sure the observer actually knows the victim before it dies.
    let victim = nodes[4].clone();
    let victim_id = victim.node_id();
    let observer_clone = observer.clone();
    wait_until(move || observer_clone.known_contacts() >= 2).await;
    victim.shutdown().await;

    let result = observer.find_nodes(victim_id).await.unwrap();
    assert!(result.iter().all(|c| c.node_id != victim_id));

    shutdown_all(vec![
        nodes[0].clone(),
        nodes[1].clone(),
        nodes[2].clone(),
        nodes[3].clone(),
    ])
    .await;
}

#[tokio::test]
async fn join_falls_back_to_the_next_bootstrap() {
    let founder = spawn_node(8).await;
    founder.join(vec![founder.contact()]).await.unwrap();

    let ghost_keypair = Keypair::from_seed([77u8; 32]);
    let ghost: Contact = Contact::new(&ghost_keypair, "127.0.0.1:9".parse().unwrap(), vec![]);

    let joiner = spawn_node(8).await;
    joiner
        .join(vec![ghost, founder.contact()])
        .await
        .expect("join succeeds through the live bootstrap");
    assert!(joiner.joined());

    shutdown_all(vec![founder, joiner]).await;
}

#[tokio::test]
async fn store_without_a_network_fails() {
    let loner = spawn_node(8).await;
    loner.join(vec![loner.contact()]).await.unwrap();

    let value = b"unreplicable".to_vec();
    let signature = loner.sign(&value);
    let err = loner
        .store(NodeId::random(), value, signature, TTL)
        .await
        .unwrap_err();
    assert_eq!(err, DhtError::NotEnoughContacts);

    loner.shutdown().await;
}

#[tokio::test]
async fn leave_yields_bootstrap_hints_for_rejoining() {
    let nodes = spawn_network(4, 3).await;
    let leaver = nodes[3].clone();

    let leaver_clone = leaver.clone();
    assert!(wait_until(move || leaver_clone.known_contacts() >= 1).await);
    let hints = leaver.leave().await;
    assert!(!hints.is_empty());

    // The hints are enough to come back.
    leaver.join(hints).await.unwrap();
    assert!(leaver.joined());

    shutdown_all(nodes).await;
}
