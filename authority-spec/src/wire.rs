//! Wire formats (spec §6): the versioned ledger event envelope sent on the
//! event bus, and the base64/hex encodings used for signatures and Merkle
//! proofs in RPC responses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto::{MerkleProof, ProofNode, SignatureBytes};
use crate::model::{AuthorityLedgerEvent, Decision, EventKind};
use crate::reason::DenialReason;
use crate::{Hash, LedgerEventId, PrincipalId, Timestamp};

/// Current schema version for `LedgerEventWire`. Bump when the wire shape
/// changes in a way existing consumers must know about.
pub const SCHEMA_VERSION: u16 = 1;

/// The versioned, tagged object form of an `AuthorityLedgerEvent` published
/// to the event bus and returned by `GET /ledger` (spec §6). Fields that
/// are absent rather than null are omitted entirely (`skip_serializing_if`)
/// to match the "null-omitted" wire rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEventWire {
    pub event_id: LedgerEventId,
    pub schema_version: u16,
    pub kind: EventKind,
    pub timestamp_millis: Timestamp,
    pub principal_id: PrincipalId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl From<&AuthorityLedgerEvent> for LedgerEventWire {
    fn from(event: &AuthorityLedgerEvent) -> Self {
        Self {
            event_id: event.id,
            schema_version: SCHEMA_VERSION,
            kind: event.kind,
            timestamp_millis: event.timestamp,
            principal_id: event.principal_id.clone(),
            mandate_id: event.mandate_id.map(hex_encode),
            decision: event.decision,
            denial_reason: event.denial_reason,
            requested_action: event.requested_action.clone(),
            requested_resource: event.requested_resource.clone(),
            correlation_id: Some(event.correlation_id.clone()),
            metadata: if event.metadata.is_null() {
                None
            } else {
                Some(event.metadata.clone())
            },
        }
    }
}

/// `base64(ed25519_signature(R || S))`, the signature wire format (spec §6).
pub fn encode_signature(signature: &SignatureBytes) -> String {
    BASE64.encode(signature)
}

pub fn decode_signature(encoded: &str) -> Option<SignatureBytes> {
    let bytes = BASE64.decode(encoded).ok()?;
    bytes.try_into().ok()
}

/// Hex-encode a 32-byte hash (mandate id, policy id, merkle root id, ...)
/// for RPC bodies and path segments.
pub fn hex_encode(bytes: Hash) -> String {
    hex::encode(bytes)
}

/// Inverse of `hex_encode`.
pub fn hex_decode(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Wire shape of a Merkle inclusion proof (spec §6): hex-encoded hashes and
/// a base64-encoded root signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProofWire {
    pub leaf_hash_hex: String,
    pub siblings_hex: Vec<String>,
    pub root_hash_hex: String,
    pub root_signature_b64: String,
    pub first_event_id: LedgerEventId,
    pub last_event_id: LedgerEventId,
}

impl MerkleProofWire {
    pub fn from_proof(
        proof: &MerkleProof,
        root_signature: &SignatureBytes,
        first_event_id: LedgerEventId,
        last_event_id: LedgerEventId,
    ) -> Self {
        Self {
            leaf_hash_hex: hex_encode(proof.leaf_hash),
            siblings_hex: proof
                .siblings
                .iter()
                .map(|n: &ProofNode| hex_encode(n.sibling))
                .collect(),
            root_hash_hex: hex_encode(proof.root_hash),
            root_signature_b64: encode_signature(root_signature),
            first_event_id,
            last_event_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrips_through_base64() {
        let sig = [7u8; 64];
        let encoded = encode_signature(&sig);
        assert_eq!(decode_signature(&encoded).unwrap(), sig);
    }

    #[test]
    fn hash_roundtrips_through_hex() {
        let hash = [9u8; 32];
        let encoded = hex_encode(hash);
        assert_eq!(hex_decode(&encoded).unwrap(), hash);
    }
}
