//! Authority engine: issue/validate/revoke/delegate over signed execution
//! mandates, and the ledger materializer that batches sealed events into
//! Merkle roots and periodic snapshots.
//!
//! This crate wires together `authority-spec` (pure crypto/policy/model),
//! `authority-core` (store/cache/resilience) and `authority-bus` (the event
//! bus) into one orchestrator.

pub mod engine;
pub mod materializer;

pub use engine::{
    AuthorityEngine, DelegateRequest, EngineConfig, EngineHealth, IssueOutcome, IssueRequest,
    RevokeOutcome, RevokeRequest, ValidateOutcome, ValidateRequest,
};
pub use materializer::{
    inclusion_proof_for_mandate, replay, LedgerMaterializer, MaterializerConfig, ReplayRequest,
    ReplayReport,
};
