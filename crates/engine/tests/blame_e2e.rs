//! Failure scenarios: timeout blame, silent leader, equivocation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{all_keys, build_cluster, test_config, DropRound, Equivocate, TestNode};
use tss_common::Status;
use tss_engine::blame::{BLAME_TSS_COORDINATOR, HASH_INCONSISTENCY};
use tss_engine::join_party::elect_leader;
use tss_engine::{KeygenRequest, KeysignRequest};
use tss_network::messages::MessageType;

async fn run_keygen(nodes: &[TestNode]) -> String {
    let keys = all_keys(nodes);
    let mut handles = Vec::new();
    for node in nodes {
        let server = node.server.clone();
        let req = KeygenRequest { keys: keys.clone() };
        handles.push(tokio::spawn(async move { server.keygen(req).await }));
    }
    let mut pool_key = String::new();
    for handle in handles {
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.status, Status::Success, "blame: {:?}", resp.blame);
        pool_key = resp.pub_key;
    }
    pool_key
}

#[tokio::test(flavor = "multi_thread")]
async fn withheld_unicast_shares_earn_a_unicast_blame() {
    let nodes = build_cluster(3, test_config(Duration::from_secs(4)));
    let pool_key = run_keygen(&nodes).await;

    // Node 2 stops sending its round-2 unicast shares from now on.
    nodes[2].policy.set(Arc::new(DropRound {
        message_type: MessageType::TssKeysign,
        round_tag: "keysign.round2",
    }));
    let culprit_key = nodes[2].node_key.clone();

    let req = KeysignRequest {
        pool_pub_key: pool_key,
        signer_pub_keys: all_keys(&nodes),
        messages: vec![BASE64.encode(b"blocked transfer")],
    };

    let mut handles = Vec::new();
    for node in &nodes {
        let server = node.server.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { server.keysign(req).await }));
    }
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    // Both honest nodes name the withholder, and only the withholder.
    for resp in &responses[..2] {
        assert_eq!(resp.status, Status::Fail);
        assert!(
            resp.blame.is_unicast,
            "expected a unicast verdict, got {:?}",
            resp.blame
        );
        assert_eq!(resp.blame.blame_nodes, vec![culprit_key.clone()]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_leader_is_blamed_by_every_follower() {
    let nodes = build_cluster(3, test_config(Duration::from_secs(3)));
    let pool_key = run_keygen(&nodes).await;

    let signer_keys = all_keys(&nodes);
    let message = BASE64.encode(b"leaderless");
    let msg_id = tss_common::keysign_session_id(&signer_keys, &[message.clone()]);
    let peers: Vec<_> = nodes.iter().map(|n| n.peer_id).collect();
    let leader_peer = elect_leader(&peers, &msg_id).unwrap();
    let leader_key = nodes
        .iter()
        .find(|n| n.peer_id == leader_peer)
        .unwrap()
        .node_key
        .clone();

    let req = KeysignRequest {
        pool_pub_key: pool_key,
        signer_pub_keys: signer_keys,
        messages: vec![message],
    };

    // The leader never shows up; only the followers call keysign.
    let mut handles = Vec::new();
    for node in nodes.iter().filter(|n| n.peer_id != leader_peer) {
        let server = node.server.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { server.keysign(req).await }));
    }

    for handle in handles {
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.status, Status::Fail);
        assert_eq!(resp.blame.fail_reason, BLAME_TSS_COORDINATOR);
        assert_eq!(resp.blame.blame_nodes, vec![leader_key.clone()]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn equivocating_broadcast_is_pinned_on_the_sender() {
    let nodes = build_cluster(4, test_config(Duration::from_secs(5)));
    let pool_key = run_keygen(&nodes).await;

    // Signers 0, 1, 2; node 1 tells node 2 a different round-1 story.
    let signer_keys: Vec<String> = all_keys(&nodes)[..3].to_vec();
    let byzantine = &nodes[1];
    let victim_peer = nodes[2].peer_id;
    byzantine.policy.set(Arc::new(Equivocate {
        message_type: MessageType::TssKeysign,
        round_tag: "keysign.round1",
        victim: victim_peer,
    }));
    let byzantine_key = byzantine.node_key.clone();

    let req = KeysignRequest {
        pool_pub_key: pool_key,
        signer_pub_keys: signer_keys,
        messages: vec![BASE64.encode(b"double spend attempt")],
    };

    let mut handles = Vec::new();
    for node in &nodes[..3] {
        let server = node.server.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { server.keysign(req).await }));
    }
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    // Both honest signers detect the conflicting hashes before the round
    // deadline and convict the equivocator.
    for (i, resp) in responses.iter().enumerate() {
        if i == 1 {
            continue;
        }
        assert_eq!(resp.status, Status::Fail);
        assert_eq!(
            resp.blame.fail_reason, HASH_INCONSISTENCY,
            "node {} verdict: {:?}",
            i, resp.blame
        );
        assert!(!resp.blame.is_unicast);
        assert_eq!(resp.blame.blame_nodes, vec![byzantine_key.clone()]);
    }
}
