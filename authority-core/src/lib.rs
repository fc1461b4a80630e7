//! Mandate store, mandate cache and resilience layer for the authority
//! engine (spec §4.B, §4.C, §4.H).
#![deny(missing_docs)]

/// Persistent CRUD over principals, policies, mandates, ledger events,
/// Merkle roots and snapshots (spec §4.B).
pub mod store;
/// Hot in-memory cache of valid mandates, keyed by mandate id (spec §4.C).
pub mod cache;
/// Circuit breakers, retry policies and rate limiters over every external
/// dependency (spec §4.H).
pub mod resilience;

pub use cache::{CacheError, MandateCache};
pub use store::{InMemoryStore, MandateStore, StoreError};
