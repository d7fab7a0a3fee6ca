//! Session identifiers and quorum arithmetic.
//!
//! A session id is the SHA-256 (hex) over the sorted participant node keys
//! and, for signing, the sorted messages to sign. Sorting makes the id
//! independent of the order the caller listed participants in, so every node
//! derives the same id for the same request.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("cannot compute a threshold for {0} participants")]
    TooFewParticipants(usize),
}

/// Quorum threshold for `n` participants: `ceil(2n/3) - 1`.
///
/// `threshold + 1` parties must be online to sign.
pub fn threshold(n: usize) -> Result<usize, IdError> {
    if n < 2 {
        return Err(IdError::TooFewParticipants(n));
    }
    Ok((2 * n).div_ceil(3) - 1)
}

/// Session id for a keygen over the given participant node keys.
pub fn keygen_session_id(keys: &[String]) -> String {
    let mut sorted = keys.to_vec();
    sorted.sort();
    digest_parts(&sorted, &[])
}

/// Session id for a keysign: participant node keys plus the base64 messages.
pub fn keysign_session_id(keys: &[String], messages: &[String]) -> String {
    let mut sorted_keys = keys.to_vec();
    sorted_keys.sort();
    let mut sorted_msgs = messages.to_vec();
    sorted_msgs.sort();
    digest_parts(&sorted_keys, &sorted_msgs)
}

fn digest_parts(keys: &[String], msgs: &[String]) -> String {
    let mut hasher = Sha256::new();
    for k in keys {
        hasher.update(k.as_bytes());
    }
    for m in msgs {
        hasher.update(m.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 of a payload, hex encoded. Used as the broadcast commitment.
pub fn payload_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_formula_holds_for_small_cohorts() {
        for n in 2..=30usize {
            let t = threshold(n).unwrap();
            assert_eq!(t, (2 * n + 2) / 3 - 1, "n={}", n);
            assert!(t + 1 <= n);
        }
        assert_eq!(threshold(4).unwrap(), 2);
        assert_eq!(threshold(3).unwrap(), 1);
        assert!(threshold(1).is_err());
    }

    #[test]
    fn session_id_is_order_independent() {
        let a = vec!["k3".to_string(), "k1".to_string(), "k2".to_string()];
        let b = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        assert_eq!(keygen_session_id(&a), keygen_session_id(&b));

        let m1 = vec!["bXNnMg==".to_string(), "bXNnMQ==".to_string()];
        let m2 = vec!["bXNnMQ==".to_string(), "bXNnMg==".to_string()];
        assert_eq!(keysign_session_id(&a, &m1), keysign_session_id(&b, &m2));
    }

    #[test]
    fn keysign_id_differs_from_keygen_id() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let msgs = vec!["bXNn".to_string()];
        assert_ne!(keygen_session_id(&keys), keysign_session_id(&keys, &msgs));
    }
}
