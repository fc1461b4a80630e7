//! Data model, crypto primitives, wire schema and the policy evaluator for
//! the authority engine.
//!
//! This crate has no I/O: everything in it is pure data and pure functions,
//! the same way `ledger-spec` carries the envelope/channel model without
//! touching storage or transport.

pub mod crypto;
pub mod model;
pub mod policy;
pub mod reason;
pub mod wire;

pub use crypto::{
    canonical_encode, derive_mandate_id, generate_keypair, load_verifying_key,
    merkle_inclusion_proof, merkle_root, sign, verify, CryptoError, MandateFields, MerkleProof,
    ProofNode, ProofPosition, PublicKey, SignatureBytes,
};
pub use model::*;
pub use policy::{delegation_within_parent, evaluate_policy, pattern_covers, MandateRequest};
pub use reason::{DenialReason, EngineError};
pub use wire::{decode_signature, encode_signature, hex_decode, hex_encode, LedgerEventWire, MerkleProofWire};

/// 32-byte digest used for content-derived identifiers and Merkle nodes.
pub type Hash = [u8; 32];

/// Seconds since the Unix epoch. `wire::LedgerEventWire::timestamp_millis`
/// carries this same value under a wire field name chosen for forward
/// compatibility with a future millisecond-resolution clock; it performs no
/// unit conversion today.
pub type Timestamp = u64;

/// Opaque principal identifier, chosen by the caller (typically a UUID
/// string or a stable external id). Never derived from content.
pub type PrincipalId = String;

/// Content-derived identifier for an execution mandate.
pub type MandateId = Hash;

/// Strictly monotonic, per-partition ledger event sequence number.
pub type LedgerEventId = u64;
