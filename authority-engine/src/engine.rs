//! The four authority operations: `issue`, `validate`, `revoke`, `delegate`.
//!
//! Every operation is fail-closed: a circuit breaker rejection on the store,
//! cache or bus never surfaces as an `Err` from here, it becomes
//! `DenialReason::DownstreamUnavailable` on the returned outcome, the same
//! way `CircuitOpenError` turns into a denied validation rather than a
//! panic or an exception in the teacher's lifecycle manager.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use authority_core::cache::SharedMandateCache;
use authority_core::resilience::circuit_breaker::CallOutcome;
use authority_core::resilience::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, IssueRateLimiter, RateLimiterConfig,
};
use authority_core::store::{MandateStore, StoreError};
use authority_bus::{Producer, Topic};
use ed25519_dalek::SigningKey;

use authority_spec::{
    self as spec, AuthorityLedgerEvent, AuthorityPolicy, Decision, DenialReason, EventKind,
    ExecutionMandate, MandateId, MandateRequest, PrincipalId, Revocation, Timestamp,
};

/// Tunables for one `AuthorityEngine` instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a cache hit may be trusted before a revocation status
    /// re-check against the store is required (default 1s).
    pub cache_revocation_staleness: Duration,
    /// Circuit breaker config guarding the mandate store.
    pub store_breaker: CircuitBreakerConfig,
    /// Circuit breaker config guarding the mandate cache.
    pub cache_breaker: CircuitBreakerConfig,
    /// Circuit breaker config guarding event-bus publish.
    pub bus_breaker: CircuitBreakerConfig,
    /// Per-issuer rate limit on `issue` calls.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_revocation_staleness: Duration::from_secs(1),
            store_breaker: CircuitBreakerConfig::default(),
            cache_breaker: CircuitBreakerConfig::default(),
            bus_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// Result of a lookup or write guarded by a circuit breaker: either the
/// value, a domain-level miss/conflict, or the breaker deciding the
/// dependency is unavailable.
enum Guarded<T> {
    Ok(T),
    NotFound,
    Conflict(String),
    Unavailable,
}

/// The authority engine: `issue`, `validate`, `revoke`, `delegate`.
pub struct AuthorityEngine {
    store: Arc<dyn MandateStore>,
    cache: SharedMandateCache,
    rate_limiter: IssueRateLimiter,
    store_breaker: CircuitBreaker,
    cache_breaker: CircuitBreaker,
    bus_breaker: CircuitBreaker,
    producer: Arc<Producer>,
    config: EngineConfig,
}

impl AuthorityEngine {
    /// Wire an engine over an already-constructed store, cache, bus producer
    /// and config.
    pub fn new(
        store: Arc<dyn MandateStore>,
        cache: SharedMandateCache,
        producer: Arc<Producer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            rate_limiter: IssueRateLimiter::new(config.rate_limiter),
            store_breaker: CircuitBreaker::new("mandate-store", config.store_breaker),
            cache_breaker: CircuitBreaker::new("mandate-cache", config.cache_breaker),
            bus_breaker: CircuitBreaker::new("event-bus", config.bus_breaker),
            producer,
            config,
        }
    }

    /// Current breaker state for each guarded dependency, for `GET /health`
    /// (spec §6: `{status, checks: {store, cache, bus}}`).
    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            store: self.store_breaker.state(),
            cache: self.cache_breaker.state(),
            bus: self.bus_breaker.state(),
        }
    }

    /// Evict every cached mandate for `subject_id` (spec §4.C: "on policy
    /// change or cascade revocation"). Callers that write a policy outside
    /// the engine (the RPC policy-CRUD handlers) must call this themselves.
    pub fn invalidate_subject_cache(&self, subject_id: &str) {
        self.cache.invalidate_by_subject(subject_id);
    }

    async fn guarded_store<T, F, Fut>(&self, f: F) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.store_breaker.call(f).await {
            Ok(v) => Guarded::Ok(v),
            Err(CallOutcome::Rejected(_)) => Guarded::Unavailable,
            Err(CallOutcome::Failed(StoreError::NotFound(_))) => Guarded::NotFound,
            Err(CallOutcome::Failed(StoreError::Conflict(msg))) => Guarded::Conflict(msg),
            Err(CallOutcome::Failed(StoreError::Storage(err))) => {
                tracing::error!(error = %err, "mandate store call failed");
                Guarded::Unavailable
            }
        }
    }

    /// Look up a mandate by cache, falling back to the store on a miss or a
    /// cache hit past the revocation staleness window (spec §4.C, §4.E step 3).
    async fn fetch_mandate(&self, id: &MandateId) -> Guarded<ExecutionMandate> {
        let cache = Arc::clone(&self.cache);
        let lookup_id = *id;
        let cached = self
            .cache_breaker
            .call(move || async move { Ok::<_, std::convert::Infallible>(cache.lookup(&lookup_id)) })
            .await;
        match cached {
            Ok(Some(cached)) if cached.cached_at.elapsed() < self.config.cache_revocation_staleness => {
                return Guarded::Ok(cached.mandate);
            }
            Ok(Some(_)) => {
                tracing::debug!(
                    mandate = %hex32(id),
                    "cache hit past revocation staleness window, re-checking store"
                );
            }
            Ok(None) => {}
            Err(CallOutcome::Rejected(_)) => return Guarded::Unavailable,
            Err(CallOutcome::Failed(never)) => match never {},
        }

        let store = Arc::clone(&self.store);
        let id = *id;
        let result = self
            .guarded_store(move || async move { store.get_mandate(&id).await })
            .await;
        if let Guarded::Ok(mandate) = &result {
            let cache = Arc::clone(&self.cache);
            let to_cache = mandate.clone();
            let _ = self
                .cache_breaker
                .call(move || async move {
                    cache.store(to_cache, now_unix());
                    Ok::<_, std::convert::Infallible>(())
                })
                .await;
        }
        result
    }

    async fn append_event(&self, event: AuthorityLedgerEvent) -> Guarded<u64> {
        let store = Arc::clone(&self.store);
        self.guarded_store(move || async move { store.append_event(event).await })
            .await
    }

    async fn publish(&self, topic: Topic, principal_id: &str, dedup_key: String, event: &AuthorityLedgerEvent) {
        let wire = spec::wire::LedgerEventWire::from(event);
        let payload = serde_json::to_value(&wire).expect("LedgerEventWire serializes infallibly");
        let producer = Arc::clone(&self.producer);
        let principal_id = principal_id.to_string();
        let outcome = self
            .bus_breaker
            .call(move || async move { producer.publish(topic, &principal_id, dedup_key, payload) })
            .await;
        match outcome {
            Ok(()) => {}
            Err(CallOutcome::Rejected(_)) => {
                tracing::warn!(topic = topic.name(), "event bus circuit open, skipping publish");
            }
            Err(CallOutcome::Failed(err)) => {
                tracing::warn!(error = %err, topic = topic.name(), "bus publish did not reach the broker synchronously");
            }
        }
    }

    /// Issue a new mandate (spec §4.E `issue`).
    pub async fn issue(
        &self,
        request: IssueRequest,
        issuer_signing_key: &SigningKey,
    ) -> IssueOutcome {
        let now = now_unix();
        let correlation_id = request.correlation_id.clone().unwrap_or_else(new_correlation_id);

        if !self.rate_limiter.check(&request.issuer_id) {
            return self
                .deny_issue(&request, DenialReason::RateLimited, now, &correlation_id)
                .await;
        }

        let policy = match self.active_policy(&request.issuer_id).await {
            Guarded::Ok(policy) => policy,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return self
                    .deny_issue(&request, DenialReason::PolicyInactive, now, &correlation_id)
                    .await
            }
            Guarded::Unavailable => {
                return self
                    .deny_issue(&request, DenialReason::DownstreamUnavailable, now, &correlation_id)
                    .await
            }
        };

        // The parent (if any) is loaded before policy evaluation so the real
        // prospective depth, not a placeholder, is what gets checked against
        // `policy.max_delegation_depth`.
        let mut delegation_depth = 0u32;
        let mut parent_mandate: Option<ExecutionMandate> = None;
        if let Some(parent_id) = request.parent_mandate_id {
            let parent = match self.fetch_mandate(&parent_id).await {
                Guarded::Ok(m) => m,
                Guarded::NotFound => {
                    return self
                        .deny_issue(&request, DenialReason::UnknownMandate, now, &correlation_id)
                        .await
                }
                Guarded::Conflict(_) => {
                    return self
                        .deny_issue(&request, DenialReason::UnknownMandate, now, &correlation_id)
                        .await
                }
                Guarded::Unavailable => {
                    return self
                        .deny_issue(&request, DenialReason::DownstreamUnavailable, now, &correlation_id)
                        .await
                }
            };
            delegation_depth = parent.delegation_depth + 1;
            parent_mandate = Some(parent);
        }

        let mandate_request = MandateRequest {
            validity_seconds: request.validity_seconds,
            resource_scope: &request.resource_scope,
            action_scope: &request.action_scope,
            parent_mandate_id: request.parent_mandate_id,
            delegation_depth,
        };
        if let Err(reason) = spec::evaluate_policy(&policy, &mandate_request) {
            return self.deny_issue(&request, reason, now, &correlation_id).await;
        }

        if let Some(parent) = &parent_mandate {
            if parent.revocation.is_revoked() || parent.is_expired(now) {
                return self
                    .deny_issue(&request, DenialReason::ParentRevoked, now, &correlation_id)
                    .await;
            }
            let child_valid_until = now + request.validity_seconds;
            if let Err(reason) = spec::delegation_within_parent(
                parent,
                &request.resource_scope,
                &request.action_scope,
                child_valid_until,
            ) {
                return self.deny_issue(&request, reason, now, &correlation_id).await;
            }
        }

        let intent_hash = request.intent.as_deref().map(hash_intent);
        let fields = spec::MandateFields {
            issuer_id: &request.issuer_id,
            subject_id: &request.subject_id,
            valid_from: now,
            valid_until: now + request.validity_seconds,
            resource_scope: &request.resource_scope,
            action_scope: &request.action_scope,
            parent_mandate_id: request.parent_mandate_id,
            delegation_depth,
            intent_hash,
        };
        let mandate_id = spec::derive_mandate_id(&fields, now);
        let signed_bytes = spec::canonical_encode(&fields);
        let signature = spec::sign(issuer_signing_key, &signed_bytes);

        let mandate = ExecutionMandate {
            mandate_id,
            issuer_id: request.issuer_id.clone(),
            subject_id: request.subject_id.clone(),
            valid_from: now,
            valid_until: now + request.validity_seconds,
            resource_scope: request.resource_scope.clone(),
            action_scope: request.action_scope.clone(),
            signature,
            created_at: now,
            parent_mandate_id: request.parent_mandate_id,
            delegation_depth,
            revocation: Revocation::active(),
            intent_hash,
        };

        let store = Arc::clone(&self.store);
        let to_put = mandate.clone();
        match self
            .guarded_store(move || async move { store.put_mandate(to_put).await })
            .await
        {
            Guarded::Ok(_) => {}
            Guarded::Conflict(msg) => {
                tracing::error!(mandate = %hex32(&mandate_id), %msg, "mandate id collision on issue");
                return self
                    .deny_issue(&request, DenialReason::DownstreamUnavailable, now, &correlation_id)
                    .await;
            }
            Guarded::NotFound | Guarded::Unavailable => {
                return self
                    .deny_issue(&request, DenialReason::DownstreamUnavailable, now, &correlation_id)
                    .await
            }
        }

        let event = AuthorityLedgerEvent {
            id: 0,
            kind: EventKind::Issued,
            timestamp: now,
            principal_id: request.issuer_id.clone(),
            mandate_id: Some(mandate_id),
            decision: Some(Decision::Allowed),
            denial_reason: None,
            requested_action: None,
            requested_resource: None,
            correlation_id: correlation_id.clone(),
            merkle_root_id: None,
            metadata: request.metadata.clone().unwrap_or(serde_json::Value::Null),
        };
        let event_id = match self.append_event(event.clone()).await {
            Guarded::Ok(id) => id,
            _ => {
                tracing::error!(mandate = %hex32(&mandate_id), "issued mandate persisted but ledger append failed");
                0
            }
        };

        self.cache.store(mandate.clone(), now);

        let mut published = event;
        published.id = event_id;
        self.publish(
            Topic::Issued,
            &request.issuer_id,
            format!("issued:{event_id}"),
            &published,
        )
        .await;

        tracing::info!(
            mandate = %hex32(&mandate_id),
            issuer = %request.issuer_id,
            subject = %request.subject_id,
            "mandate issued"
        );
        IssueOutcome::Issued(mandate)
    }

    async fn deny_issue(
        &self,
        request: &IssueRequest,
        reason: DenialReason,
        now: Timestamp,
        correlation_id: &str,
    ) -> IssueOutcome {
        tracing::warn!(issuer = %request.issuer_id, reason = %reason, "issue denied");
        let event = AuthorityLedgerEvent {
            id: 0,
            kind: EventKind::Denied,
            timestamp: now,
            principal_id: request.issuer_id.clone(),
            mandate_id: None,
            decision: Some(Decision::Denied),
            denial_reason: Some(reason),
            requested_action: None,
            requested_resource: None,
            correlation_id: correlation_id.to_string(),
            merkle_root_id: None,
            metadata: serde_json::Value::Null,
        };
        if let Guarded::Ok(event_id) = self.append_event(event.clone()).await {
            let mut published = event;
            published.id = event_id;
            self.publish(
                Topic::ValidatedOrDenied,
                &request.issuer_id,
                format!("denied-issue:{event_id}"),
                &published,
            )
            .await;
        }
        IssueOutcome::Denied(reason)
    }

    async fn active_policy(&self, principal_id: &str) -> Guarded<AuthorityPolicy> {
        let store = Arc::clone(&self.store);
        let principal_id = principal_id.to_string();
        self.guarded_store(move || async move { store.get_active_policy(&principal_id).await })
            .await
    }

    /// Validate a mandate against a requested action/resource (spec §4.E `validate`).
    pub async fn validate(&self, request: ValidateRequest) -> ValidateOutcome {
        let now = now_unix();
        let correlation_id = request.correlation_id.clone();

        let mandate = match self.fetch_mandate(&request.mandate_id).await {
            Guarded::Ok(m) => m,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return self.deny_validate(&request, DenialReason::UnknownMandate, now).await
            }
            Guarded::Unavailable => {
                return self
                    .deny_validate(&request, DenialReason::DownstreamUnavailable, now)
                    .await
            }
        };

        if mandate.is_expired(now) {
            return self.deny_validate(&request, DenialReason::Expired, now).await;
        }
        if mandate.is_not_yet_valid(now) {
            return self.deny_validate(&request, DenialReason::NotYetValid, now).await;
        }
        if mandate.revocation.is_revoked() {
            return self.deny_validate(&request, DenialReason::Revoked, now).await;
        }

        let issuer = match self.principal(&mandate.issuer_id).await {
            Guarded::Ok(p) => p,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return self
                    .deny_validate(&request, DenialReason::SignatureInvalid, now)
                    .await
            }
            Guarded::Unavailable => {
                return self
                    .deny_validate(&request, DenialReason::DownstreamUnavailable, now)
                    .await
            }
        };
        let fields = spec::MandateFields {
            issuer_id: &mandate.issuer_id,
            subject_id: &mandate.subject_id,
            valid_from: mandate.valid_from,
            valid_until: mandate.valid_until,
            resource_scope: &mandate.resource_scope,
            action_scope: &mandate.action_scope,
            parent_mandate_id: mandate.parent_mandate_id,
            delegation_depth: mandate.delegation_depth,
            intent_hash: mandate.intent_hash,
        };
        let signed_bytes = spec::canonical_encode(&fields);
        if !spec::verify(&issuer.public_key, &signed_bytes, &mandate.signature) {
            return self
                .deny_validate(&request, DenialReason::SignatureInvalid, now)
                .await;
        }

        let mut ancestor_id = mandate.parent_mandate_id;
        while let Some(id) = ancestor_id {
            let ancestor = match self.fetch_mandate(&id).await {
                Guarded::Ok(m) => m,
                Guarded::NotFound | Guarded::Conflict(_) => {
                    return self.deny_validate(&request, DenialReason::ParentRevoked, now).await
                }
                Guarded::Unavailable => {
                    return self
                        .deny_validate(&request, DenialReason::DownstreamUnavailable, now)
                        .await
                }
            };
            if ancestor.revocation.is_revoked() || ancestor.is_expired(now) {
                return self.deny_validate(&request, DenialReason::ParentRevoked, now).await;
            }
            ancestor_id = ancestor.parent_mandate_id;
        }

        if !mandate.action_scope.iter().any(|a| a == &request.requested_action) {
            return self
                .deny_validate(&request, DenialReason::ActionOutOfScope, now)
                .await;
        }
        let resource_ok = mandate
            .resource_scope
            .iter()
            .any(|allowed| spec::pattern_covers(allowed, &request.requested_resource));
        if !resource_ok {
            return self
                .deny_validate(&request, DenialReason::ResourceOutOfScope, now)
                .await;
        }
        if let Some(expected) = mandate.intent_hash {
            match request.intent.as_deref().map(hash_intent) {
                Some(supplied) if supplied == expected => {}
                _ => return self.deny_validate(&request, DenialReason::IntentMismatch, now).await,
            }
        }

        let event = AuthorityLedgerEvent {
            id: 0,
            kind: EventKind::Validated,
            timestamp: now,
            principal_id: mandate.subject_id.clone(),
            mandate_id: Some(mandate.mandate_id),
            decision: Some(Decision::Allowed),
            denial_reason: None,
            requested_action: Some(request.requested_action.clone()),
            requested_resource: Some(request.requested_resource.clone()),
            correlation_id: correlation_id.clone(),
            merkle_root_id: None,
            metadata: serde_json::Value::Null,
        };
        self.record_decision(event, &mandate.subject_id).await;

        tracing::debug!(mandate = %hex32(&mandate.mandate_id), "validation allowed");
        ValidateOutcome::Allowed
    }

    async fn deny_validate(&self, request: &ValidateRequest, reason: DenialReason, now: Timestamp) -> ValidateOutcome {
        tracing::warn!(mandate = %hex32(&request.mandate_id), reason = %reason, "validation denied");
        let event = AuthorityLedgerEvent {
            id: 0,
            kind: EventKind::Denied,
            timestamp: now,
            principal_id: String::new(),
            mandate_id: Some(request.mandate_id),
            decision: Some(Decision::Denied),
            denial_reason: Some(reason),
            requested_action: Some(request.requested_action.clone()),
            requested_resource: Some(request.requested_resource.clone()),
            correlation_id: request.correlation_id.clone(),
            merkle_root_id: None,
            metadata: serde_json::Value::Null,
        };
        self.record_decision(event, "").await;
        ValidateOutcome::Denied(reason)
    }

    async fn record_decision(&self, event: AuthorityLedgerEvent, partition_key: &str) {
        if let Guarded::Ok(event_id) = self.append_event(event.clone()).await {
            let mut published = event;
            published.id = event_id;
            let key = if partition_key.is_empty() {
                published
                    .mandate_id
                    .map(|id| hex32(&id))
                    .unwrap_or_else(|| "unknown".to_string())
            } else {
                partition_key.to_string()
            };
            self.publish(
                Topic::ValidatedOrDenied,
                &key,
                format!("validated-or-denied:{event_id}"),
                &published,
            )
            .await;
        }
    }

    async fn principal(&self, id: &str) -> Guarded<authority_spec::Principal> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        self.guarded_store(move || async move { store.get_principal_by_id(&id).await })
            .await
    }

    /// Revoke a mandate, optionally cascading to its delegated descendants
    /// (spec §4.E `revoke`).
    pub async fn revoke(&self, request: RevokeRequest) -> RevokeOutcome {
        let now = now_unix();
        let mandate = match self.fetch_mandate(&request.mandate_id).await {
            Guarded::Ok(m) => m,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return RevokeOutcome::Denied(DenialReason::UnknownMandate)
            }
            Guarded::Unavailable => return RevokeOutcome::Denied(DenialReason::DownstreamUnavailable),
        };

        if !self.revoker_authorized(&mandate, &request.revoker_id).await {
            return RevokeOutcome::Unauthorized;
        }

        let store = Arc::clone(&self.store);
        let mandate_id = request.mandate_id;
        let reason = request.reason.clone();
        let cascade = request.cascade;
        let outcome = self
            .guarded_store(move || async move {
                store
                    .revoke_mandate(&mandate_id, reason, now, cascade)
                    .await
            })
            .await;
        let revoked_ids = match outcome {
            Guarded::Ok(outcome) => outcome.revoked_ids,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return RevokeOutcome::Denied(DenialReason::UnknownMandate)
            }
            Guarded::Unavailable => return RevokeOutcome::Denied(DenialReason::DownstreamUnavailable),
        };

        for id in &revoked_ids {
            self.cache.invalidate(id);
            let event = AuthorityLedgerEvent {
                id: 0,
                kind: EventKind::Revoked,
                timestamp: now,
                principal_id: request.revoker_id.clone(),
                mandate_id: Some(*id),
                decision: None,
                denial_reason: None,
                requested_action: None,
                requested_resource: None,
                correlation_id: new_correlation_id(),
                merkle_root_id: None,
                metadata: serde_json::json!({ "reason": request.reason }),
            };
            if let Guarded::Ok(event_id) = self.append_event(event.clone()).await {
                let mut published = event;
                published.id = event_id;
                self.publish(Topic::Revoked, &request.revoker_id, format!("revoked:{event_id}"), &published)
                    .await;
            }
        }

        tracing::info!(
            mandate = %hex32(&request.mandate_id),
            revoked_count = revoked_ids.len(),
            cascade = request.cascade,
            "mandate revoked"
        );
        RevokeOutcome::Revoked {
            revoked_ids,
            revoked_at: now,
        }
    }

    async fn revoker_authorized(&self, mandate: &ExecutionMandate, revoker_id: &str) -> bool {
        if revoker_id == mandate.issuer_id {
            return true;
        }
        if let Guarded::Ok(revoker) = self.principal(revoker_id).await {
            if revoker
                .metadata
                .get("role")
                .and_then(|v| v.as_str())
                .map(|role| role == "admin")
                .unwrap_or(false)
            {
                return true;
            }
        }
        let mut ancestor_id = mandate.parent_mandate_id;
        while let Some(id) = ancestor_id {
            match self.fetch_mandate(&id).await {
                Guarded::Ok(ancestor) => {
                    if ancestor.issuer_id == revoker_id {
                        return true;
                    }
                    ancestor_id = ancestor.parent_mandate_id;
                }
                _ => return false,
            }
        }
        false
    }

    /// Delegate a new mandate from an existing one: a thin wrapper over
    /// `issue` with `parent_mandate_id` set and the issuer taken to be the
    /// parent's subject (spec §4.E `delegate`).
    pub async fn delegate(
        &self,
        request: DelegateRequest,
        delegator_signing_key: &SigningKey,
    ) -> IssueOutcome {
        let parent = match self.fetch_mandate(&request.parent_mandate_id).await {
            Guarded::Ok(m) => m,
            Guarded::NotFound | Guarded::Conflict(_) => {
                return IssueOutcome::Denied(DenialReason::UnknownMandate)
            }
            Guarded::Unavailable => return IssueOutcome::Denied(DenialReason::DownstreamUnavailable),
        };
        let issue_request = IssueRequest {
            issuer_id: parent.subject_id.clone(),
            subject_id: request.child_subject_id,
            resource_scope: request.resource_scope,
            action_scope: request.action_scope,
            validity_seconds: request.validity_seconds,
            intent: None,
            parent_mandate_id: Some(request.parent_mandate_id),
            correlation_id: request.correlation_id,
            metadata: None,
        };
        self.issue(issue_request, delegator_signing_key).await
    }
}

/// `issue` request fields (spec §6 `POST /mandates`).
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub issuer_id: PrincipalId,
    pub subject_id: PrincipalId,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub validity_seconds: u64,
    pub intent: Option<String>,
    pub parent_mandate_id: Option<MandateId>,
    pub correlation_id: Option<String>,
    /// Caller-supplied metadata (spec §6 `POST /mandates` `metadata?`),
    /// carried onto the `issued` ledger event; never part of the mandate's
    /// signed bytes.
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of `issue`/`delegate`.
#[derive(Debug, Clone)]
pub enum IssueOutcome {
    Issued(ExecutionMandate),
    Denied(DenialReason),
}

/// `validate` request fields (spec §6 `POST /mandates/validate`).
#[derive(Debug, Clone)]
pub struct ValidateRequest {
    pub mandate_id: MandateId,
    pub requested_action: String,
    pub requested_resource: String,
    pub correlation_id: String,
    pub intent: Option<String>,
}

/// Outcome of `validate`.
#[derive(Debug, Clone, Copy)]
pub enum ValidateOutcome {
    Allowed,
    Denied(DenialReason),
}

/// `revoke` request fields (spec §6 `DELETE /mandates/{id}`).
#[derive(Debug, Clone)]
pub struct RevokeRequest {
    pub mandate_id: MandateId,
    pub revoker_id: PrincipalId,
    pub reason: String,
    pub cascade: bool,
}

/// Outcome of `revoke`.
#[derive(Debug, Clone)]
pub enum RevokeOutcome {
    Revoked {
        revoked_ids: Vec<MandateId>,
        revoked_at: Timestamp,
    },
    Denied(DenialReason),
    /// The caller is not the issuer, not an ancestor issuer, and holds no
    /// admin role on the affected mandate (spec §4.E step 1). Kept distinct
    /// from `Denied`: this is an authorization failure on an administrative
    /// operation, not one of the 17 validation denial reasons.
    Unauthorized,
}

/// `delegate` request fields (spec §6 `POST /mandates/delegate`).
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub parent_mandate_id: MandateId,
    pub child_subject_id: PrincipalId,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub validity_seconds: u64,
    pub correlation_id: Option<String>,
}

/// Breaker state for each of the engine's three guarded dependencies.
#[derive(Debug, Clone, Copy)]
pub struct EngineHealth {
    pub store: BreakerState,
    pub cache: BreakerState,
    pub bus: BreakerState,
}

impl EngineHealth {
    /// `true` if every guarded dependency is `Closed` or probing via
    /// `HalfOpen`; `false` if any breaker has tripped `Open`.
    pub fn is_healthy(&self) -> bool {
        !matches!(self.store, BreakerState::Open)
            && !matches!(self.cache, BreakerState::Open)
            && !matches!(self.bus, BreakerState::Open)
    }
}

fn now_unix() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn new_correlation_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "corr-{}-{}",
        now_unix(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn hash_intent(intent: &str) -> authority_spec::Hash {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"authority:intent:v1");
    hasher.update(intent.as_bytes());
    hasher.finalize().into()
}

fn hex32(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use authority_bus::{EventBus, ProducerConfig};
    use authority_core::cache::MandateCache;
    use authority_core::store::InMemoryStore;
    use authority_spec::{AuthorityPolicy, Principal, PrincipalKind};

    fn engine() -> (AuthorityEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MandateCache::new());
        let bus = Arc::new(EventBus::new());
        let producer = Arc::new(Producer::new(Arc::clone(&bus), ProducerConfig::default()));
        let engine = AuthorityEngine::new(
            store.clone() as Arc<dyn MandateStore>,
            cache,
            producer,
            EngineConfig::default(),
        );
        (engine, store)
    }

    async fn seed_issuer(store: &InMemoryStore, signing_key: &SigningKey) {
        let principal = Principal {
            id: "issuer-1".into(),
            name: "issuer-1".into(),
            kind: PrincipalKind::Agent,
            parent_id: None,
            public_key: signing_key.verifying_key().to_bytes(),
            created_at: 0,
            metadata: serde_json::Value::Null,
            active: true,
        };
        store.put_principal(principal).await.unwrap();
        let policy = AuthorityPolicy {
            policy_id: [1u8; 32],
            principal_id: "issuer-1".into(),
            allowed_resource_patterns: vec!["repo:acme/*".into()],
            allowed_actions: vec!["read".into(), "write".into()],
            max_validity_seconds: 3600,
            delegation_allowed: true,
            max_delegation_depth: 2,
            active: true,
            created_at: 0,
            creator: "admin".into(),
            version: 1,
        };
        store.put_policy(policy).await.unwrap();
    }

    #[tokio::test]
    async fn issue_then_validate_allows_in_scope_action() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let outcome = engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await;
        let mandate = match outcome {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("expected issue to succeed, denied: {reason:?}"),
        };

        let result = engine
            .validate(ValidateRequest {
                mandate_id: mandate.mandate_id,
                requested_action: "read".into(),
                requested_resource: "repo:acme/widgets".into(),
                correlation_id: "corr-1".into(),
                intent: None,
            })
            .await;
        assert!(matches!(result, ValidateOutcome::Allowed));
    }

    #[tokio::test]
    async fn validate_denies_action_outside_scope() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let mandate = match engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await
        {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };

        let result = engine
            .validate(ValidateRequest {
                mandate_id: mandate.mandate_id,
                requested_action: "write".into(),
                requested_resource: "repo:acme/widgets".into(),
                correlation_id: "corr-2".into(),
                intent: None,
            })
            .await;
        assert!(matches!(result, ValidateOutcome::Denied(DenialReason::ActionOutOfScope)));
    }

    #[tokio::test]
    async fn revoke_then_validate_denies_revoked() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let mandate = match engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await
        {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };

        let revoke_outcome = engine
            .revoke(RevokeRequest {
                mandate_id: mandate.mandate_id,
                revoker_id: "issuer-1".into(),
                reason: "testing".into(),
                cascade: true,
            })
            .await;
        assert!(matches!(revoke_outcome, RevokeOutcome::Revoked { .. }));

        let result = engine
            .validate(ValidateRequest {
                mandate_id: mandate.mandate_id,
                requested_action: "read".into(),
                requested_resource: "repo:acme/widgets".into(),
                correlation_id: "corr-3".into(),
                intent: None,
            })
            .await;
        assert!(matches!(result, ValidateOutcome::Denied(DenialReason::Revoked)));
    }

    #[tokio::test]
    async fn revoke_denies_caller_with_no_authority_over_the_mandate() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let mandate = match engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await
        {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };

        let revoke_outcome = engine
            .revoke(RevokeRequest {
                mandate_id: mandate.mandate_id,
                revoker_id: "some-unrelated-agent".into(),
                reason: "testing".into(),
                cascade: false,
            })
            .await;
        assert!(matches!(revoke_outcome, RevokeOutcome::Unauthorized));
    }

    #[tokio::test]
    async fn issue_denies_resource_outside_policy() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let outcome = engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:other/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await;
        assert!(matches!(outcome, IssueOutcome::Denied(DenialReason::ResourceNotAllowed)));
    }

    #[tokio::test]
    async fn delegate_narrows_scope_under_parent() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        let parent = match engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into(), "write".into()],
                    validity_seconds: 3600,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await
        {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };

        let subject_policy = AuthorityPolicy {
            policy_id: [2u8; 32],
            principal_id: "agent-1".into(),
            allowed_resource_patterns: vec!["repo:acme/*".into()],
            allowed_actions: vec!["read".into(), "write".into()],
            max_validity_seconds: 3600,
            delegation_allowed: true,
            max_delegation_depth: 2,
            active: true,
            created_at: 0,
            creator: "issuer-1".into(),
            version: 1,
        };
        store.put_policy(subject_policy).await.unwrap();

        let outcome = engine
            .delegate(
                DelegateRequest {
                    parent_mandate_id: parent.mandate_id,
                    child_subject_id: "agent-2".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    correlation_id: None,
                },
                &signing_key,
            )
            .await;
        let child = match outcome {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };
        assert_eq!(child.delegation_depth, 1);
        assert_eq!(child.parent_mandate_id, Some(parent.mandate_id));
    }

    #[tokio::test]
    async fn delegate_denies_when_depth_exceeds_policy_max() {
        let (engine, store) = engine();
        let (signing_key, _) = spec::generate_keypair();
        seed_issuer(&store, &signing_key).await;

        // `delegate()` re-targets the issuer to the parent's subject, so the
        // depth check that matters is against *this* principal's policy.
        let subject_policy = AuthorityPolicy {
            policy_id: [2u8; 32],
            principal_id: "agent-1".into(),
            allowed_resource_patterns: vec!["repo:acme/*".into()],
            allowed_actions: vec!["read".into(), "write".into()],
            max_validity_seconds: 3600,
            delegation_allowed: true,
            max_delegation_depth: 0,
            active: true,
            created_at: 0,
            creator: "issuer-1".into(),
            version: 1,
        };
        store.put_policy(subject_policy).await.unwrap();

        let outcome = engine
            .issue(
                IssueRequest {
                    issuer_id: "issuer-1".into(),
                    subject_id: "agent-1".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    intent: None,
                    parent_mandate_id: None,
                    correlation_id: None,
                    metadata: None,
                },
                &signing_key,
            )
            .await;
        let parent = match outcome {
            IssueOutcome::Issued(m) => m,
            IssueOutcome::Denied(reason) => panic!("unexpected denial: {reason:?}"),
        };

        let outcome = engine
            .delegate(
                DelegateRequest {
                    parent_mandate_id: parent.mandate_id,
                    child_subject_id: "agent-2".into(),
                    resource_scope: vec!["repo:acme/widgets".into()],
                    action_scope: vec!["read".into()],
                    validity_seconds: 60,
                    correlation_id: None,
                },
                &signing_key,
            )
            .await;
        assert!(matches!(
            outcome,
            IssueOutcome::Denied(DenialReason::DelegationDepthExceeded)
        ));
    }
}
