//! Crypto primitives (spec §4.A): key generation, deterministic signing and
//! constant-time verification, canonical mandate encoding, and a SHA-256
//! Merkle tree with inclusion proofs.
//!
//! Verification never panics and never raises: a bad signature or a
//! malformed signature byte string both yield `false`. A malformed *key* is
//! the one fatal case here (spec §4.A) and surfaces as `CryptoError`, which
//! callers treat as a configuration error, not a denial.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Hash;

/// Ed25519 public key bytes.
pub type PublicKey = [u8; 32];
/// Raw 64-byte `R || S` Ed25519 signature.
pub type SignatureBytes = [u8; 64];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed key material: {0}")]
    MalformedKey(String),
}

/// Generate a fresh Ed25519 keypair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Sign `bytes` with `signing_key`. Ed25519 signing is deterministic: the
/// same key and message always produce the same signature.
pub fn sign(signing_key: &SigningKey, bytes: &[u8]) -> SignatureBytes {
    signing_key.sign(bytes).to_bytes()
}

/// Verify a signature against a public key and message. Returns `false` on
/// any failure, including a malformed signature encoding — never panics.
pub fn verify(public_key: &PublicKey, bytes: &[u8], signature: &SignatureBytes) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key.verify(bytes, &sig).is_ok()
}

/// Parse raw key bytes into a `VerifyingKey`, surfacing malformed keys as a
/// fatal configuration error rather than a silent `false` verification.
pub fn load_verifying_key(public_key: &PublicKey) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(public_key)
        .map_err(|err| CryptoError::MalformedKey(err.to_string()))
}

/// The fields of a mandate that are covered by its signature (spec §4.A).
/// Deliberately excludes `mandate_id`, `created_at`, `signature` and
/// `revocation`: the id is content-derived from this struct, timestamps of
/// issuance and revocation state are ledger concerns, not signed facts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MandateFields<'a> {
    pub issuer_id: &'a str,
    pub subject_id: &'a str,
    pub valid_from: u64,
    pub valid_until: u64,
    pub resource_scope: &'a [String],
    pub action_scope: &'a [String],
    pub parent_mandate_id: Option<Hash>,
    pub delegation_depth: u32,
    pub intent_hash: Option<Hash>,
}

/// Canonical, deterministic encoding of a mandate's signed fields.
///
/// `serde_json::Map` is backed by a `BTreeMap` (the `preserve_order` feature
/// is not enabled), so serializing through it yields sorted-key JSON: two
/// equal field sets always encode to the same bytes regardless of
/// construction order.
pub fn canonical_encode(fields: &MandateFields<'_>) -> Vec<u8> {
    let mut map = serde_json::Map::new();
    map.insert("issuer_id".into(), fields.issuer_id.into());
    map.insert("subject_id".into(), fields.subject_id.into());
    map.insert("valid_from".into(), fields.valid_from.into());
    map.insert("valid_until".into(), fields.valid_until.into());
    map.insert(
        "resource_scope".into(),
        serde_json::Value::from(fields.resource_scope.to_vec()),
    );
    map.insert(
        "action_scope".into(),
        serde_json::Value::from(fields.action_scope.to_vec()),
    );
    map.insert(
        "parent_mandate_id".into(),
        match fields.parent_mandate_id {
            Some(h) => serde_json::Value::from(hex::encode(h)),
            None => serde_json::Value::Null,
        },
    );
    map.insert("delegation_depth".into(), fields.delegation_depth.into());
    map.insert(
        "intent_hash".into(),
        match fields.intent_hash {
            Some(h) => serde_json::Value::from(hex::encode(h)),
            None => serde_json::Value::Null,
        },
    );
    serde_json::to_vec(&serde_json::Value::Object(map)).expect("canonical encoding is infallible")
}

/// Content-derive a mandate id from its signed fields and its creation
/// timestamp.
pub fn derive_mandate_id(fields: &MandateFields<'_>, created_at: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(b"authority:mandate-id:v1");
    hasher.update(canonical_encode(fields));
    hasher.update(created_at.to_le_bytes());
    hasher.finalize().into()
}

fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().into()
}

fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Build every level of the tree, bottom-up. An odd node at any level is
/// promoted to the next level unchanged rather than paired with itself.
fn build_levels(leaves: &[Hash]) -> Vec<Vec<Hash>> {
    let mut levels = vec![leaves.to_vec()];
    let mut current = leaves.to_vec();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        let mut i = 0;
        while i < current.len() {
            if i + 1 < current.len() {
                next.push(parent_hash(&current[i], &current[i + 1]));
                i += 2;
            } else {
                next.push(current[i]);
                i += 1;
            }
        }
        levels.push(next.clone());
        current = next;
    }
    levels
}

/// Compute the Merkle root over a batch of leaf payloads (spec §4.A, §8).
/// Returns the all-zero hash for an empty batch; callers (the materializer)
/// never seal an empty batch in practice.
pub fn merkle_root(leaves: &[&[u8]]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let hashed: Vec<Hash> = leaves.iter().map(|l| leaf_hash(l)).collect();
    let levels = build_levels(&hashed);
    levels.last().unwrap()[0]
}

/// Which side of the parent hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProofPosition {
    Left,
    Right,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProofNode {
    pub sibling: Hash,
    pub position: ProofPosition,
}

/// An inclusion proof for one leaf in a sealed Merkle batch (spec §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: Hash,
    pub index: usize,
    pub leaf_count: usize,
    pub siblings: Vec<ProofNode>,
    pub root_hash: Hash,
}

/// Build an inclusion proof for the leaf at `index` within `leaves`.
pub fn merkle_inclusion_proof(leaves: &[&[u8]], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }
    let hashed: Vec<Hash> = leaves.iter().map(|l| leaf_hash(l)).collect();
    let levels = build_levels(&hashed);
    let mut siblings = Vec::new();
    let mut idx = index;
    for level in &levels[..levels.len() - 1] {
        if idx % 2 == 0 {
            if idx + 1 < level.len() {
                siblings.push(ProofNode {
                    sibling: level[idx + 1],
                    position: ProofPosition::Right,
                });
            }
        } else {
            siblings.push(ProofNode {
                sibling: level[idx - 1],
                position: ProofPosition::Left,
            });
        }
        idx /= 2;
    }
    Some(MerkleProof {
        leaf_hash: hashed[index],
        index,
        leaf_count: leaves.len(),
        siblings,
        root_hash: *levels.last().unwrap().first().unwrap(),
    })
}

impl MerkleProof {
    /// Replay the sibling path and check it reproduces `root_hash`.
    pub fn verify(&self) -> bool {
        let mut acc = self.leaf_hash;
        for node in &self.siblings {
            acc = match node.position {
                ProofPosition::Left => parent_hash(&node.sibling, &acc),
                ProofPosition::Right => parent_hash(&acc, &node.sibling),
            };
        }
        acc == self.root_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, vk) = generate_keypair();
        let msg = b"hello mandate";
        let sig = sign(&sk, msg);
        assert!(verify(&vk.to_bytes(), msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let (sk, vk) = generate_keypair();
        let sig = sign(&sk, b"original");
        assert!(!verify(&vk.to_bytes(), b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_malformed_key_without_panic() {
        let bad_key = [0xffu8; 32];
        let sig = [0u8; 64];
        assert!(!verify(&bad_key, b"anything", &sig));
    }

    #[test]
    fn canonical_encode_is_order_independent() {
        let a = MandateFields {
            issuer_id: "alice",
            subject_id: "bob",
            valid_from: 1,
            valid_until: 2,
            resource_scope: &["repo:a".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
            intent_hash: None,
        };
        let bytes1 = canonical_encode(&a);
        let bytes2 = canonical_encode(&a);
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn merkle_root_is_deterministic_for_even_and_odd_batches() {
        let leaves: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let root1 = merkle_root(&leaves);
        let root2 = merkle_root(&leaves);
        assert_eq!(root1, root2);
    }

    #[test]
    fn merkle_inclusion_proof_verifies_for_every_leaf() {
        let data = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()];
        let leaves: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let root = merkle_root(&leaves);
        for i in 0..leaves.len() {
            let proof = merkle_inclusion_proof(&leaves, i).expect("proof");
            assert_eq!(proof.root_hash, root);
            assert!(proof.verify());
        }
    }

    #[test]
    fn merkle_inclusion_proof_fails_on_wrong_root() {
        let data = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let leaves: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let mut proof = merkle_inclusion_proof(&leaves, 1).expect("proof");
        proof.root_hash[0] ^= 0xff;
        assert!(!proof.verify());
    }
}
