//! Cryptographic primitives for Coinpit
//!
//! Keys live on NIST P-256. A public key travels as the raw 64-byte `x || y`
//! concatenation and is locked to by its RIPEMD160(SHA256(pubkey)) hash.

use crate::error::ChainError;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Type alias for a public-key hash (RIPEMD160 output).
pub type PubKeyHash = [u8; 20];

pub const ADDRESS_VERSION: u8 = 0x00;
pub const CHECKSUM_LENGTH: usize = 4;
/// version + pubkey hash + checksum
pub const ADDRESS_BYTES: usize = 1 + 20 + CHECKSUM_LENGTH;
const COORDINATE_SIZE: usize = 32;

/// RIPEMD160(SHA256(public_key)).
pub fn hash_pub_key(public_key: &[u8]) -> PubKeyHash {
    let sha = Sha256::digest(public_key);
    Ripemd160::digest(sha).into()
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&second[..CHECKSUM_LENGTH]);
    out
}

/// Encode a public-key hash as a checksummed hex address.
pub fn address_from_pub_key_hash(pub_key_hash: &PubKeyHash) -> String {
    let mut payload = Vec::with_capacity(ADDRESS_BYTES);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    hex::encode(payload)
}

/// Decode an address back into the public-key hash it locks to.
pub fn pub_key_hash_from_address(address: &str) -> Result<PubKeyHash, ChainError> {
    let bytes = hex::decode(address)
        .map_err(|e| ChainError::Validation(format!("Invalid address {}: {}", address, e)))?;
    if bytes.len() != ADDRESS_BYTES {
        return Err(ChainError::Validation(format!(
            "Address must be {} bytes, got {}",
            ADDRESS_BYTES,
            bytes.len()
        )));
    }

    let (payload, actual) = bytes.split_at(ADDRESS_BYTES - CHECKSUM_LENGTH);
    if payload[0] != ADDRESS_VERSION {
        return Err(ChainError::Validation(format!(
            "Unsupported address version {:#04x}",
            payload[0]
        )));
    }
    if checksum(payload) != actual {
        return Err(ChainError::Validation(format!("Address checksum mismatch: {}", address)));
    }

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok(hash)
}

pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        KeyPair {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Creates a KeyPair from raw secret scalar bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != COORDINATE_SIZE {
            return Err(ChainError::Crypto(format!(
                "Secret key must be {} bytes, got {}",
                COORDINATE_SIZE,
                bytes.len()
            )));
        }
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| ChainError::Crypto(format!("Invalid secret key bytes: {}", e)))?;
        Ok(KeyPair { signing_key })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| ChainError::Crypto(format!("Invalid secret key hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_bytes(&self) -> [u8; COORDINATE_SIZE] {
        self.signing_key.to_bytes().into()
    }

    /// Raw `x || y`, 64 bytes.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        // Drop the SEC1 0x04 tag.
        point.as_bytes()[1..].to_vec()
    }

    pub fn pub_key_hash(&self) -> PubKeyHash {
        hash_pub_key(&self.public_key_bytes())
    }

    pub fn address(&self) -> String {
        address_from_pub_key_hash(&self.pub_key_hash())
    }

    /// Signs an already computed 32-byte hash and returns `r || s`.
    pub fn sign_hash(&self, hash: &[u8]) -> Result<Vec<u8>, ChainError> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(hash)
            .map_err(|e| ChainError::Crypto(format!("Failed to sign: {}", e)))?;
        let (r, s) = signature.split_bytes();
        let mut out = Vec::with_capacity(2 * COORDINATE_SIZE);
        out.extend_from_slice(&r);
        out.extend_from_slice(&s);
        Ok(out)
    }
}

/// Left-pads a big-endian integer to a field element; rejects oversize input.
fn field_bytes(half: &[u8]) -> Option<FieldBytes> {
    if half.is_empty() || half.len() > COORDINATE_SIZE {
        return None;
    }
    let mut padded = [0u8; COORDINATE_SIZE];
    padded[COORDINATE_SIZE - half.len()..].copy_from_slice(half);
    Some(FieldBytes::clone_from_slice(&padded))
}

/// Checks an `r || s` signature over `hash` against a raw `x || y` public key.
///
/// Both byte strings are split exactly in half. Anything that fails to parse
/// counts as a failed verification.
pub fn verify_hash(public_key: &[u8], hash: &[u8], signature: &[u8]) -> bool {
    let (x, y) = public_key.split_at(public_key.len() / 2);
    let (r, s) = signature.split_at(signature.len() / 2);

    let (Some(x), Some(y), Some(r), Some(s)) =
        (field_bytes(x), field_bytes(y), field_bytes(r), field_bytes(s))
    else {
        return false;
    };

    let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
    let Ok(verifying_key) = VerifyingKey::from_encoded_point(&point) else {
        return false;
    };
    let Ok(signature) = Signature::from_scalars(r, s) else {
        return false;
    };

    verifying_key.verify_prehash(hash, &signature).is_ok()
}
