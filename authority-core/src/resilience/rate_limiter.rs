//! Per-principal sliding-window rate limiter over `issue` calls (spec
//! §4.H): default 10/minute and 100/hour. The limiter itself is fail-open —
//! an internal error never denies an `issue` call, it is only logged — so a
//! limiter outage degrades to "no limiting" rather than a fresh source of
//! fail-closed denials (spec §4.H is explicit that this is the one place
//! the fail-closed default does not apply).
//!
//! Built on `governor`'s keyed GCRA limiter rather than hand-rolling the
//! sorted-set-of-timestamps scheme spec.md sketches for its Redis-backed
//! reference implementation: GCRA is the idiomatic Rust equivalent of a
//! sliding-window counter and avoids an unbounded per-principal timestamp
//! list.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

use authority_spec::PrincipalId;

/// Limits applied per issuer principal (spec §4.H defaults: 10/minute,
/// 100/hour).
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum `issue` calls per rolling minute.
    pub per_minute: NonZeroU32,
    /// Maximum `issue` calls per rolling hour.
    pub per_hour: NonZeroU32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            per_minute: nonzero!(10u32),
            per_hour: nonzero!(100u32),
        }
    }
}

type KeyedLimiter = RateLimiter<PrincipalId, DefaultKeyedStateStore<PrincipalId>, DefaultClock>;

/// Dual-window (minute + hour) rate limiter keyed by issuer principal id.
pub struct IssueRateLimiter {
    per_minute: KeyedLimiter,
    per_hour: KeyedLimiter,
}

impl IssueRateLimiter {
    /// Build a limiter from the given config.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            per_minute: RateLimiter::keyed(Quota::per_minute(config.per_minute)),
            per_hour: RateLimiter::keyed(Quota::per_hour(config.per_hour)),
        }
    }

    /// Whether `issuer_id` may issue right now. Always fail-open: any
    /// internal inconsistency is logged and treated as "allow" (spec §4.H).
    pub fn check(&self, issuer_id: &PrincipalId) -> bool {
        let minute_ok = self.per_minute.check_key(issuer_id).is_ok();
        if !minute_ok {
            tracing::debug!(issuer = %issuer_id, window = "minute", "issue rate limit exceeded");
            return false;
        }
        let hour_ok = self.per_hour.check_key(issuer_id).is_ok();
        if !hour_ok {
            tracing::debug!(issuer = %issuer_id, window = "hour", "issue rate limit exceeded");
        }
        hour_ok
    }
}

impl Default for IssueRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_minute_budget_then_denies() {
        let limiter = IssueRateLimiter::new(RateLimiterConfig {
            per_minute: nonzero!(3u32),
            per_hour: nonzero!(1000u32),
        });
        let issuer: PrincipalId = "issuer-1".into();
        for _ in 0..3 {
            assert!(limiter.check(&issuer));
        }
        assert!(!limiter.check(&issuer));
    }

    #[test]
    fn separate_issuers_get_separate_budgets() {
        let limiter = IssueRateLimiter::new(RateLimiterConfig {
            per_minute: nonzero!(1u32),
            per_hour: nonzero!(1000u32),
        });
        assert!(limiter.check(&"a".to_string()));
        assert!(limiter.check(&"b".to_string()));
        assert!(!limiter.check(&"a".to_string()));
    }
}
