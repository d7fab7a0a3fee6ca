//! Conversions between node keys and libp2p identities.
//!
//! A node owns one long-lived secp256k1 keypair. Its node key is the
//! hex-encoded compressed public key; its peer id is the libp2p peer id of
//! the same key, so the `node key -> peer id` mapping can be rebuilt by any
//! party that knows the participant list.

use libp2p::identity;
use libp2p::PeerId;

use crate::error::NetworkError;

/// Derive the libp2p peer id for a hex-encoded compressed secp256k1 key.
pub fn peer_id_from_node_key(node_key: &str) -> Result<PeerId, NetworkError> {
    let bytes = hex::decode(node_key)
        .map_err(|e| NetworkError::InvalidKey(format!("node key is not hex: {}", e)))?;
    let public = identity::secp256k1::PublicKey::try_from_bytes(&bytes)
        .map_err(|e| NetworkError::InvalidKey(format!("not a secp256k1 public key: {}", e)))?;
    Ok(PeerId::from_public_key(&identity::PublicKey::from(public)))
}

/// Hex node key of a transport keypair.
pub fn node_key_from_keypair(keypair: &identity::Keypair) -> Result<String, NetworkError> {
    let public = keypair
        .public()
        .try_into_secp256k1()
        .map_err(|_| NetworkError::InvalidKey("transport identity is not secp256k1".to_string()))?;
    Ok(hex::encode(public.to_bytes()))
}

/// Build the transport identity from the hex secret key read at startup.
pub fn keypair_from_secret_hex(secret_hex: &str) -> Result<identity::Keypair, NetworkError> {
    let mut bytes = hex::decode(secret_hex.trim())
        .map_err(|e| NetworkError::InvalidKey(format!("secret key is not hex: {}", e)))?;
    let secret = identity::secp256k1::SecretKey::try_from_bytes(&mut bytes)
        .map_err(|e| NetworkError::InvalidKey(format!("not a secp256k1 secret key: {}", e)))?;
    Ok(identity::Keypair::from(identity::secp256k1::Keypair::from(
        secret,
    )))
}
