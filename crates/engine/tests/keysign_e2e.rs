//! End-to-end keysign over the in-process hub: quorum signing, notifier
//! fan-out to the non-signer, and batch ordering.

mod common;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{all_keys, build_cluster, test_config, verify_signature, TestNode};
use tss_common::Status;
use tss_engine::{KeygenRequest, KeysignRequest};

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
async fn offline_participant_receives_the_signature_via_notifier() {
    let nodes = build_cluster(4, test_config(Duration::from_secs(10)));
    let pool_key = run_keygen(&nodes).await;

    // Three signers; the fourth node holds a share but is not selected.
    let signer_keys: Vec<String> = all_keys(&nodes)[..3].to_vec();
    let message = BASE64.encode(b"spend 42 to alice");
    let req = KeysignRequest {
        pool_pub_key: pool_key.clone(),
        signer_pub_keys: signer_keys.clone(),
        messages: vec![message.clone()],
    };

    // The waiter subscribes first so the notifier push cannot race past it.
    let waiter = {
        let server = nodes[3].server.clone();
        let req = req.clone();
        tokio::spawn(async move { server.keysign(req).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut handles = Vec::new();
    for node in &nodes[..3] {
        let server = node.server.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { server.keysign(req).await }));
    }

    let mut signer_responses = Vec::new();
    for handle in handles {
        signer_responses.push(handle.await.unwrap().unwrap());
    }
    for resp in &signer_responses {
        assert_eq!(resp.status, Status::Success, "blame: {:?}", resp.blame);
        assert_eq!(resp.signatures.len(), 1);
        assert_eq!(resp.signatures[0].msg, message);
        verify_signature(&pool_key, &resp.signatures[0]);
    }

    // The non-signer got the very same signature out of band.
    let waited = waiter.await.unwrap().unwrap();
    assert_eq!(waited.status, Status::Success);
    assert_eq!(waited.signatures.len(), 1);
    assert_eq!(waited.signatures[0].r, signer_responses[0].signatures[0].r);
    assert_eq!(waited.signatures[0].s, signer_responses[0].signatures[0].s);
    verify_signature(&pool_key, &waited.signatures[0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_sign_returns_every_signature_sorted_ascending() {
    let nodes = build_cluster(4, test_config(Duration::from_secs(10)));
    let pool_key = run_keygen(&nodes).await;

    let plain: Vec<&[u8]> = vec![b"charlie", b"alpha", b"bravo"];
    let messages: Vec<String> = plain.iter().map(|m| BASE64.encode(m)).collect();
    let req = KeysignRequest {
        pool_pub_key: pool_key.clone(),
        signer_pub_keys: all_keys(&nodes),
        messages: messages.clone(),
    };

    let mut handles = Vec::new();
    for node in &nodes {
        let server = node.server.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { server.keysign(req).await }));
    }

    for handle in handles {
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.status, Status::Success, "blame: {:?}", resp.blame);
        assert_eq!(resp.signatures.len(), plain.len());

        // Ascending by the big-endian value of the signed message.
        let decoded: Vec<Vec<u8>> = resp
            .signatures
            .iter()
            .map(|s| BASE64.decode(&s.msg).unwrap())
            .collect();
        let mut expected = decoded.clone();
        expected.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        assert_eq!(decoded, expected);

        // Same multiset of messages as the request.
        let mut requested: Vec<Vec<u8>> = plain.iter().map(|m| m.to_vec()).collect();
        requested.sort();
        let mut got = decoded.clone();
        got.sort();
        assert_eq!(got, requested);

        for sig in &resp.signatures {
            verify_signature(&pool_key, sig);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn too_few_signers_is_an_error_not_a_blame() {
    let nodes = build_cluster(4, test_config(Duration::from_secs(5)));
    let pool_key = run_keygen(&nodes).await;

    // threshold(4) = 2, so two signers are not enough.
    let req = KeysignRequest {
        pool_pub_key: pool_key,
        signer_pub_keys: all_keys(&nodes)[..2].to_vec(),
        messages: vec![BASE64.encode(b"m")],
    };
    let err = nodes[0].server.keysign(req).await.unwrap_err();
    assert!(matches!(
        err,
        tss_engine::EngineError::NotEnoughSigners { threshold: 2, signers: 2 }
    ));
}
