//! Mandate cache (spec §4.C): a hot in-memory cache of valid mandates,
//! keyed by mandate id, with a TTL derived from `valid_until` and a
//! revocation-staleness contract the authority engine cross-checks on every
//! hit.
//!
//! The cache is authoritative for the *signed mandate bytes* but never for
//! revocation status (spec §4.C, §4.E step 3, §9 open question): every
//! lookup returns the cached mandate together with the instant it was
//! cached, so the engine can decide whether a store round-trip is needed to
//! refresh the revocation flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

use authority_spec::{ExecutionMandate, MandateId, PrincipalId};

/// Errors raised by the mandate cache. Cache failures are fail-open for
/// reads (a miss just falls back to the store) but the resilience layer
/// still wraps cache calls so that cache *unavailability* (e.g. a
/// distributed cache connection reset) can trip its own circuit breaker.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The distributed cache backend is unreachable.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// A cached mandate plus the instant it was stored, so callers can enforce
/// the cache-revocation staleness window (spec §4.E step 3, default 1s).
#[derive(Debug, Clone)]
pub struct CachedMandate {
    /// The cached, signed mandate bytes (conceptually; here the typed value).
    pub mandate: ExecutionMandate,
    /// When this entry was stored, for staleness checks.
    pub cached_at: Instant,
}

struct Entry {
    cached: CachedMandate,
    expires_at: Instant,
}

/// Hot in-memory cache of valid mandates, keyed by `mandate:<id>` (spec
/// §4.C, §6). Negative caching is prohibited: a miss is always a miss, never
/// a cached "does not exist" marker, so a mandate issued after a prior miss
/// is visible on the very next lookup.
pub struct MandateCache {
    entries: DashMap<MandateId, Entry>,
    by_subject: DashMap<PrincipalId, Vec<MandateId>>,
    min_ttl: Duration,
}

impl Default for MandateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MandateCache {
    /// Create an empty cache. Startup loads no entries; the cache warms
    /// lazily from store fallbacks (spec §4.C).
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_subject: DashMap::new(),
            min_ttl: Duration::from_secs(1),
        }
    }

    /// Store `mandate` under `mandate:<id>` with TTL `max(1s, valid_until -
    /// now)` (spec §4.C).
    pub fn store(&self, mandate: ExecutionMandate, now_unix: u64) {
        let remaining = mandate.valid_until.saturating_sub(now_unix);
        let ttl = Duration::from_secs(remaining).max(self.min_ttl);
        let subject = mandate.subject_id.clone();
        let id = mandate.mandate_id;
        self.entries.insert(
            id,
            Entry {
                cached: CachedMandate {
                    mandate,
                    cached_at: Instant::now(),
                },
                expires_at: Instant::now() + ttl,
            },
        );
        self.by_subject.entry(subject).or_default().push(id);
    }

    /// Look up a mandate by id. Expired entries are treated as a miss and
    /// evicted.
    pub fn lookup(&self, id: &MandateId) -> Option<CachedMandate> {
        let hit = {
            let entry = self.entries.get(id)?;
            if entry.expires_at <= Instant::now() {
                None
            } else {
                Some(entry.cached.clone())
            }
        };
        if hit.is_none() {
            self.entries.remove(id);
        }
        hit
    }

    /// Evict a single mandate, on revocation (spec §4.C, §4.E step 3).
    pub fn invalidate(&self, id: &MandateId) {
        self.entries.remove(id);
    }

    /// Evict every mandate cached for `subject_id`, on policy change or
    /// cascade revocation (spec §4.C).
    pub fn invalidate_by_subject(&self, subject_id: &str) {
        if let Some((_, ids)) = self.by_subject.remove(subject_id) {
            for id in ids {
                self.entries.remove(&id);
            }
        }
    }

    /// Number of live (non-expired) entries, for health/metrics reporting.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    /// Whether the cache currently holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle type used throughout the engine wiring.
pub type SharedMandateCache = Arc<MandateCache>;
