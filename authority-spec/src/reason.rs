//! Stable, enumerable reasons an authority decision can fail, and the
//! distinct error-kind taxonomy lower components raise (spec §4.D, §4.E,
//! §7). `DenialReason` is part of the wire contract: renaming a variant is
//! a breaking change for every client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a policy check or a mandate validation failed. Returned to callers,
/// never thrown as an exception (spec §9 redesign flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    #[error("issuer policy is not active")]
    PolicyInactive,
    #[error("requested validity window exceeds policy max_validity")]
    ValidityExceeded,
    #[error("requested resource scope is not covered by policy")]
    ResourceNotAllowed,
    #[error("requested action scope is not covered by policy")]
    ActionNotAllowed,
    #[error("policy does not allow delegation")]
    DelegationNotAllowed,
    #[error("delegation depth exceeds policy max_delegation_depth")]
    DelegationDepthExceeded,
    #[error("mandate id does not resolve to a known mandate")]
    UnknownMandate,
    #[error("mandate validity window has ended")]
    Expired,
    #[error("mandate validity window has not started")]
    NotYetValid,
    #[error("mandate has been revoked")]
    Revoked,
    #[error("an ancestor in the delegation chain has been revoked or expired")]
    ParentRevoked,
    #[error("mandate signature does not verify")]
    SignatureInvalid,
    #[error("requested action is outside the mandate's action scope")]
    ActionOutOfScope,
    #[error("requested resource is outside the mandate's resource scope")]
    ResourceOutOfScope,
    #[error("requested intent hash does not match the mandate's intent hash")]
    IntentMismatch,
    #[error("issuer has exceeded its issue rate limit")]
    RateLimited,
    #[error("a downstream dependency is unavailable; failing closed")]
    DownstreamUnavailable,
}

/// Typed error kinds raised by the store, cache, bus and crypto layers.
/// Only `authority-engine` translates these into `DenialReason`s; every
/// other component propagates them upward untranslated.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),
    #[error("signature error: {0}")]
    SignatureError(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
