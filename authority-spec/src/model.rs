//! Core data model: principals, policies, mandates and ledger events.
//!
//! Field shapes follow spec §3 directly. Types here are plain data; the
//! invariants named in spec §3 are enforced by `authority-engine`, not here.

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SignatureBytes};
use crate::{Hash, LedgerEventId, MandateId, PrincipalId, Timestamp};

/// What kind of actor a principal represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Agent,
    Service,
}

/// An identity that can hold policies, issue mandates, or be their subject.
///
/// Immutable except `metadata`; deletion is a soft `active = false` flag so
/// that historical mandates and ledger events referencing the principal
/// remain resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub name: String,
    pub kind: PrincipalKind,
    pub parent_id: Option<PrincipalId>,
    pub public_key: PublicKey,
    pub created_at: Timestamp,
    pub metadata: serde_json::Value,
    pub active: bool,
}

/// One version of a principal's authority policy.
///
/// Exactly one version is active per principal at a time; `put_policy`
/// inactivates the prior active version in the same transaction, and full
/// history is retained (spec §3, §4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityPolicy {
    pub policy_id: Hash,
    pub principal_id: PrincipalId,
    pub allowed_resource_patterns: Vec<String>,
    pub allowed_actions: Vec<String>,
    pub max_validity_seconds: u64,
    pub delegation_allowed: bool,
    pub max_delegation_depth: u32,
    pub active: bool,
    pub created_at: Timestamp,
    pub creator: PrincipalId,
    pub version: u32,
}

/// Revocation state carried on a mandate. The only mutable part of a
/// mandate once issued (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revocation {
    pub status: RevocationStatus,
    pub revoked_at: Option<Timestamp>,
    pub reason: Option<String>,
}

impl Revocation {
    pub fn active() -> Self {
        Self {
            status: RevocationStatus::Active,
            revoked_at: None,
            reason: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.status, RevocationStatus::Revoked)
    }
}

/// A short-lived, signed execution authorization (spec §3).
///
/// Immutable except `revocation`. `resource_scope` and `action_scope` are
/// ordered glob lists; order matters for `canonical_encode` but not for
/// matching semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMandate {
    pub mandate_id: MandateId,
    pub issuer_id: PrincipalId,
    pub subject_id: PrincipalId,
    pub valid_from: Timestamp,
    pub valid_until: Timestamp,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub signature: SignatureBytes,
    pub created_at: Timestamp,
    pub parent_mandate_id: Option<MandateId>,
    pub delegation_depth: u32,
    pub revocation: Revocation,
    pub intent_hash: Option<Hash>,
}

impl ExecutionMandate {
    /// Whether `now` falls within `[valid_from, valid_until]` inclusive.
    pub fn in_validity_window(&self, now: Timestamp) -> bool {
        now >= self.valid_from && now <= self.valid_until
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.valid_until
    }

    pub fn is_not_yet_valid(&self, now: Timestamp) -> bool {
        now < self.valid_from
    }
}

/// Decision recorded on `validated`/`denied` ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
}

/// The kind of an append-only ledger event (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Issued,
    Validated,
    Denied,
    Revoked,
}

/// One row of the append-only authority ledger.
///
/// Append-only except for `merkle_root_id`, which the materializer attaches
/// once the event is sealed into a batch (spec §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityLedgerEvent {
    pub id: LedgerEventId,
    pub kind: EventKind,
    pub timestamp: Timestamp,
    pub principal_id: PrincipalId,
    pub mandate_id: Option<MandateId>,
    pub decision: Option<Decision>,
    pub denial_reason: Option<crate::reason::DenialReason>,
    pub requested_action: Option<String>,
    pub requested_resource: Option<String>,
    pub correlation_id: String,
    pub merkle_root_id: Option<Hash>,
    pub metadata: serde_json::Value,
}

/// A sealed, signed Merkle batch over a contiguous range of ledger events
/// (spec §3, §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleRootRecord {
    pub root_id: Hash,
    pub root_hash: Hash,
    pub first_event_id: LedgerEventId,
    pub last_event_id: LedgerEventId,
    pub event_count: u64,
    pub created_at: Timestamp,
    pub signing_principal: PrincipalId,
    pub signature: SignatureBytes,
}

/// What caused a ledger snapshot to be taken (spec §3, §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Scheduled,
    Manual,
    Recovery,
}

/// A point-in-time projection of active principals, active policies and
/// live mandates, anchored to the last sealed Merkle root (spec §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub snapshot_id: Hash,
    pub created_at: Timestamp,
    pub last_included_event_id: LedgerEventId,
    pub size_bytes: u64,
    pub event_count: u64,
    pub content_hash: Hash,
    pub trigger: SnapshotTrigger,
}
