//! The authority RPC surface (spec §6): `POST /mandates`, `POST
//! /mandates/validate`, `POST /mandates/delegate`, `DELETE /mandates/{id}`,
//! `GET /mandates/{id}/proof`, `GET /ledger`, and direct CRUD over
//! `principals`/`policies`.
//!
//! Every handler is a thin `axum` adapter: decode the JSON body, translate
//! hex-encoded ids, call the engine or the store directly, re-encode the
//! result. No authorization or business logic lives here — it belongs to
//! `authority-engine`. No authorization or business logic lives here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use authority_core::store::{LedgerFilter, MandateStore, StoreError};
use authority_engine::{
    inclusion_proof_for_mandate, AuthorityEngine, DelegateRequest, IssueOutcome, IssueRequest,
    RevokeOutcome, RevokeRequest, ValidateOutcome, ValidateRequest,
};
use authority_spec::{
    hex_decode, hex_encode, AuthorityPolicy, DenialReason, ExecutionMandate, LedgerEventWire,
    MandateId, Principal, PrincipalKind,
};

use crate::keystore::Keystore;
use crate::metrics::DaemonMetrics;

/// Everything an RPC handler needs: the engine for the four authority
/// operations, direct store access for principal/policy/ledger CRUD the
/// engine doesn't own, and the keystore the engine needs a caller's private
/// key from.
pub struct RpcState {
    pub engine: Arc<AuthorityEngine>,
    pub store: Arc<dyn MandateStore>,
    pub keystore: Arc<Keystore>,
    pub metrics: DaemonMetrics,
}

pub fn router(state: Arc<RpcState>) -> Router {
    Router::new()
        .route("/mandates", post(issue_mandate))
        .route("/mandates/validate", post(validate_mandate))
        .route("/mandates/delegate", post(delegate_mandate))
        .route("/mandates/:id", delete(revoke_mandate))
        .route("/mandates/:id/proof", get(mandate_inclusion_proof))
        .route("/ledger", get(query_ledger))
        .route("/principals", post(create_principal).get(list_principals))
        .route("/policies", post(create_policy).get(list_policies))
        .with_state(state)
}

/// `{error_code, message, correlation_id}` (spec §6): the one failure
/// envelope every administrative endpoint returns.
#[derive(Serialize)]
struct ErrorEnvelope {
    error_code: &'static str,
    message: String,
    correlation_id: String,
}

enum RpcError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Forbidden(String),
    SignatureError(String),
    DownstreamUnavailable,
    Internal(String),
}

impl RpcError {
    fn code(&self) -> &'static str {
        match self {
            RpcError::Validation(_) => "validation_error",
            RpcError::NotFound(_) => "not_found",
            RpcError::Conflict(_) => "conflict",
            RpcError::Forbidden(_) => "forbidden",
            RpcError::SignatureError(_) => "signature_error",
            RpcError::DownstreamUnavailable => "downstream_unavailable",
            RpcError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RpcError::Validation(_) => StatusCode::BAD_REQUEST,
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::Conflict(_) => StatusCode::CONFLICT,
            RpcError::Forbidden(_) => StatusCode::FORBIDDEN,
            RpcError::SignatureError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RpcError::DownstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            RpcError::Validation(m)
            | RpcError::NotFound(m)
            | RpcError::Conflict(m)
            | RpcError::Forbidden(m)
            | RpcError::SignatureError(m)
            | RpcError::Internal(m) => m.clone(),
            RpcError::DownstreamUnavailable => "a downstream dependency is unavailable".to_string(),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => RpcError::NotFound(m),
            StoreError::Conflict(m) => RpcError::Conflict(m),
            StoreError::Storage(err) => RpcError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorEnvelope {
            error_code: self.code(),
            message: self.message(),
            correlation_id: new_correlation_id(),
        };
        (self.status(), Json(body)).into_response()
    }
}

fn new_correlation_id() -> String {
    format!("rpc-{}", uuid_like())
}

/// A v4-shaped but RNG-free correlation id: enough entropy for request
/// tracing without pulling in a `uuid` dependency the teacher's stack
/// doesn't already carry.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{n:016x}")
}

fn parse_mandate_id(raw: &str) -> Result<MandateId, RpcError> {
    hex_decode(raw).ok_or_else(|| RpcError::Validation(format!("malformed mandate id: {raw}")))
}

fn mandate_to_json(mandate: &ExecutionMandate) -> serde_json::Value {
    serde_json::json!({
        "mandate_id": hex_encode(mandate.mandate_id),
        "issuer_id": mandate.issuer_id,
        "subject_id": mandate.subject_id,
        "valid_from": mandate.valid_from,
        "valid_until": mandate.valid_until,
        "resource_scope": mandate.resource_scope,
        "action_scope": mandate.action_scope,
        "signature": authority_spec::encode_signature(&mandate.signature),
        "created_at": mandate.created_at,
        "parent_mandate_id": mandate.parent_mandate_id.map(hex_encode),
        "delegation_depth": mandate.delegation_depth,
        "revoked": mandate.revocation.is_revoked(),
        "intent_hash": mandate.intent_hash.map(hex_encode),
    })
}

// ---- POST /mandates -------------------------------------------------

#[derive(Deserialize)]
struct IssueBody {
    issuer_id: String,
    subject_id: String,
    resource_scope: Vec<String>,
    action_scope: Vec<String>,
    validity_seconds: u64,
    intent: Option<String>,
    parent_mandate_id: Option<String>,
    metadata: Option<serde_json::Value>,
}

async fn issue_mandate(
    State(state): State<Arc<RpcState>>,
    Json(body): Json<IssueBody>,
) -> Result<impl IntoResponse, RpcError> {
    let start = Instant::now();
    let parent_mandate_id = body
        .parent_mandate_id
        .as_deref()
        .map(parse_mandate_id)
        .transpose()?;
    let signing_key = state
        .keystore
        .get(&body.issuer_id)
        .ok_or_else(|| RpcError::SignatureError(format!("no signing key held for issuer {}", body.issuer_id)))?;

    let outcome = state
        .engine
        .issue(
            IssueRequest {
                issuer_id: body.issuer_id,
                subject_id: body.subject_id,
                resource_scope: body.resource_scope,
                action_scope: body.action_scope,
                validity_seconds: body.validity_seconds,
                intent: body.intent,
                parent_mandate_id,
                correlation_id: None,
                metadata: body.metadata,
            },
            signing_key,
        )
        .await;

    let latency = start.elapsed().as_millis() as f64;
    state
        .metrics
        .operation_latency_ms
        .with_label_values(&["issue"])
        .observe(latency);
    match outcome {
        IssueOutcome::Issued(mandate) => {
            state.metrics.operations_total.with_label_values(&["issue", "issued"]).inc();
            Ok((StatusCode::OK, Json(mandate_to_json(&mandate))).into_response())
        }
        IssueOutcome::Denied(reason) => {
            state.metrics.operations_total.with_label_values(&["issue", "denied"]).inc();
            state.metrics.denials_total.with_label_values(&[reason_label(reason)]).inc();
            Ok((StatusCode::OK, Json(serde_json::json!({ "allowed": false, "denial_reason": reason }))).into_response())
        }
    }
}

// ---- POST /mandates/validate -----------------------------------------

#[derive(Deserialize)]
struct ValidateBody {
    mandate_id: String,
    requested_action: String,
    requested_resource: String,
    correlation_id: Option<String>,
    intent: Option<String>,
}

#[derive(Serialize)]
struct ValidateResponse {
    allowed: bool,
    mandate_id: String,
    principal_id: String,
    decision_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    denial_reason: Option<DenialReason>,
    correlation_id: String,
}

async fn validate_mandate(
    State(state): State<Arc<RpcState>>,
    Json(body): Json<ValidateBody>,
) -> Result<impl IntoResponse, RpcError> {
    let start = Instant::now();
    let mandate_id = parse_mandate_id(&body.mandate_id)?;
    let correlation_id = body.correlation_id.clone().unwrap_or_else(new_correlation_id);

    // Best-effort lookup purely to report `principal_id` in the response;
    // the engine re-resolves the mandate itself and is the sole source of
    // the actual decision.
    let principal_id = state
        .store
        .get_mandate(&mandate_id)
        .await
        .map(|m| m.subject_id)
        .unwrap_or_default();

    let outcome = state
        .engine
        .validate(ValidateRequest {
            mandate_id,
            requested_action: body.requested_action,
            requested_resource: body.requested_resource,
            correlation_id: correlation_id.clone(),
            intent: body.intent,
        })
        .await;

    let latency = start.elapsed().as_millis() as f64;
    state.metrics.operation_latency_ms.with_label_values(&["validate"]).observe(latency);

    let decision_timestamp = now_unix();
    let response = match outcome {
        ValidateOutcome::Allowed => {
            state.metrics.operations_total.with_label_values(&["validate", "allowed"]).inc();
            ValidateResponse {
                allowed: true,
                mandate_id: body.mandate_id,
                principal_id,
                decision_timestamp,
                denial_reason: None,
                correlation_id,
            }
        }
        ValidateOutcome::Denied(reason) => {
            state.metrics.operations_total.with_label_values(&["validate", "denied"]).inc();
            state.metrics.denials_total.with_label_values(&[reason_label(reason)]).inc();
            ValidateResponse {
                allowed: false,
                mandate_id: body.mandate_id,
                principal_id,
                decision_timestamp,
                denial_reason: Some(reason),
                correlation_id,
            }
        }
    };
    Ok((StatusCode::OK, Json(response)))
}

// ---- POST /mandates/delegate ------------------------------------------

#[derive(Deserialize)]
struct DelegateBody {
    parent_mandate_id: String,
    child_subject_id: String,
    resource_scope: Vec<String>,
    action_scope: Vec<String>,
    validity_seconds: u64,
}

async fn delegate_mandate(
    State(state): State<Arc<RpcState>>,
    Json(body): Json<DelegateBody>,
) -> Result<impl IntoResponse, RpcError> {
    let parent_mandate_id = parse_mandate_id(&body.parent_mandate_id)?;
    let parent = state.store.get_mandate(&parent_mandate_id).await?;
    let signing_key = state.keystore.get(&parent.subject_id).ok_or_else(|| {
        RpcError::SignatureError(format!("no signing key held for delegator {}", parent.subject_id))
    })?;

    let outcome = state
        .engine
        .delegate(
            DelegateRequest {
                parent_mandate_id,
                child_subject_id: body.child_subject_id,
                resource_scope: body.resource_scope,
                action_scope: body.action_scope,
                validity_seconds: body.validity_seconds,
                correlation_id: None,
            },
            signing_key,
        )
        .await;

    match outcome {
        IssueOutcome::Issued(mandate) => {
            state.metrics.operations_total.with_label_values(&["delegate", "issued"]).inc();
            Ok((StatusCode::OK, Json(mandate_to_json(&mandate))).into_response())
        }
        IssueOutcome::Denied(reason) => {
            state.metrics.operations_total.with_label_values(&["delegate", "denied"]).inc();
            state.metrics.denials_total.with_label_values(&[reason_label(reason)]).inc();
            Ok((StatusCode::OK, Json(serde_json::json!({ "allowed": false, "denial_reason": reason }))).into_response())
        }
    }
}

// ---- DELETE /mandates/{id} ---------------------------------------------

#[derive(Deserialize)]
struct RevokeBody {
    revoker_id: String,
    reason: String,
    cascade: bool,
}

#[derive(Serialize)]
struct RevokeResponse {
    mandate_id: String,
    revoked: bool,
    revoked_at: Option<u64>,
    revocation_reason: String,
    cascade: bool,
    revoked_count: usize,
}

async fn revoke_mandate(
    State(state): State<Arc<RpcState>>,
    Path(id): Path<String>,
    Json(body): Json<RevokeBody>,
) -> Result<impl IntoResponse, RpcError> {
    let mandate_id = parse_mandate_id(&id)?;
    let revoker_id = body.revoker_id.clone();
    let outcome = state
        .engine
        .revoke(RevokeRequest {
            mandate_id,
            revoker_id: body.revoker_id,
            reason: body.reason.clone(),
            cascade: body.cascade,
        })
        .await;

    match outcome {
        RevokeOutcome::Revoked { revoked_ids, revoked_at } => {
            state.metrics.operations_total.with_label_values(&["revoke", "revoked"]).inc();
            Ok((
                StatusCode::OK,
                Json(RevokeResponse {
                    mandate_id: id,
                    revoked: true,
                    revoked_at: Some(revoked_at),
                    revocation_reason: body.reason,
                    cascade: body.cascade,
                    revoked_count: revoked_ids.len(),
                }),
            ))
        }
        RevokeOutcome::Denied(reason) => {
            state.metrics.operations_total.with_label_values(&["revoke", "denied"]).inc();
            state.metrics.denials_total.with_label_values(&[reason_label(reason)]).inc();
            Err(RpcError::Validation(reason.to_string()))
        }
        RevokeOutcome::Unauthorized => {
            state.metrics.operations_total.with_label_values(&["revoke", "unauthorized"]).inc();
            Err(RpcError::Forbidden(format!(
                "{revoker_id} is not authorized to revoke mandate {id}"
            )))
        }
    }
}

// ---- GET /mandates/{id}/proof -------------------------------------------

async fn mandate_inclusion_proof(
    State(state): State<Arc<RpcState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, RpcError> {
    let mandate_id = parse_mandate_id(&id)?;
    match inclusion_proof_for_mandate(state.store.as_ref(), mandate_id).await? {
        Some(proof) => Ok((StatusCode::OK, Json(proof)).into_response()),
        None => Err(RpcError::NotFound(format!(
            "mandate {id} has no sealed inclusion proof yet"
        ))),
    }
}

// ---- GET /ledger --------------------------------------------------------

#[derive(Serialize)]
struct LedgerPageResponse {
    events: Vec<LedgerEventWire>,
    total_count: usize,
    limit: usize,
    offset: usize,
}

async fn query_ledger(
    State(state): State<Arc<RpcState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, RpcError> {
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(100);
    let offset: usize = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mandate_id = match params.get("mandate_id") {
        Some(raw) => Some(parse_mandate_id(raw)?),
        None => None,
    };
    let kind = match params.get("event_type") {
        Some(raw) => Some(parse_event_kind(raw)?),
        None => None,
    };
    let filter = LedgerFilter {
        principal_id: params.get("principal_id").cloned(),
        mandate_id,
        kind,
        start_time: params.get("start_time").and_then(|v| v.parse().ok()),
        end_time: params.get("end_time").and_then(|v| v.parse().ok()),
    };
    let page = state.store.query_ledger(filter, limit, offset).await?;
    Ok((
        StatusCode::OK,
        Json(LedgerPageResponse {
            events: page.events.iter().map(LedgerEventWire::from).collect(),
            total_count: page.total_count,
            limit,
            offset,
        }),
    ))
}

fn parse_event_kind(raw: &str) -> Result<authority_spec::EventKind, RpcError> {
    use authority_spec::EventKind;
    match raw {
        "issued" => Ok(EventKind::Issued),
        "validated" => Ok(EventKind::Validated),
        "denied" => Ok(EventKind::Denied),
        "revoked" => Ok(EventKind::Revoked),
        other => Err(RpcError::Validation(format!("unknown event_type: {other}"))),
    }
}

// ---- principals ---------------------------------------------------------

#[derive(Deserialize)]
struct CreatePrincipalBody {
    id: String,
    name: String,
    kind: PrincipalKind,
    parent_id: Option<String>,
    public_key_hex: String,
    metadata: Option<serde_json::Value>,
}

async fn create_principal(
    State(state): State<Arc<RpcState>>,
    Json(body): Json<CreatePrincipalBody>,
) -> Result<impl IntoResponse, RpcError> {
    let public_key = hex_decode(&body.public_key_hex)
        .ok_or_else(|| RpcError::Validation("malformed public_key_hex".to_string()))?;
    let principal = Principal {
        id: body.id,
        name: body.name,
        kind: body.kind,
        parent_id: body.parent_id,
        public_key,
        created_at: now_unix(),
        metadata: body.metadata.unwrap_or(serde_json::Value::Null),
        active: true,
    };
    let stored = state.store.put_principal(principal).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Deserialize)]
struct PageParams {
    page: Option<usize>,
    size: Option<usize>,
}

async fn list_principals(
    State(state): State<Arc<RpcState>>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, RpcError> {
    let page = state
        .store
        .list_principals(params.page.unwrap_or(0), params.size.unwrap_or(50))
        .await?;
    Ok((StatusCode::OK, Json(page)))
}

// ---- policies -------------------------------------------------------------

#[derive(Deserialize)]
struct CreatePolicyBody {
    principal_id: String,
    allowed_resource_patterns: Vec<String>,
    allowed_actions: Vec<String>,
    max_validity_seconds: u64,
    delegation_allowed: bool,
    max_delegation_depth: u32,
    creator: String,
}

async fn create_policy(
    State(state): State<Arc<RpcState>>,
    Json(body): Json<CreatePolicyBody>,
) -> Result<impl IntoResponse, RpcError> {
    let previous_versions = state
        .store
        .list_policy_versions(&body.principal_id)
        .await
        .unwrap_or_default();
    let version = previous_versions.len() as u32 + 1;
    let policy_id = authority_spec::derive_mandate_id(
        &authority_spec::MandateFields {
            issuer_id: &body.principal_id,
            subject_id: &body.principal_id,
            valid_from: 0,
            valid_until: 0,
            resource_scope: &body.allowed_resource_patterns,
            action_scope: &body.allowed_actions,
            parent_mandate_id: None,
            delegation_depth: version,
            intent_hash: None,
        },
        now_unix(),
    );
    let policy = AuthorityPolicy {
        policy_id,
        principal_id: body.principal_id,
        allowed_resource_patterns: body.allowed_resource_patterns,
        allowed_actions: body.allowed_actions,
        max_validity_seconds: body.max_validity_seconds,
        delegation_allowed: body.delegation_allowed,
        max_delegation_depth: body.max_delegation_depth,
        active: true,
        created_at: now_unix(),
        creator: body.creator,
        version,
    };
    let stored = state.store.put_policy(policy).await?;
    state.engine.invalidate_subject_cache(&stored.principal_id);
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn list_policies(
    State(state): State<Arc<RpcState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, RpcError> {
    let principal_id = params
        .get("principal_id")
        .ok_or_else(|| RpcError::Validation("principal_id query parameter is required".to_string()))?;
    let versions = state.store.list_policy_versions(principal_id).await?;
    Ok((StatusCode::OK, Json(versions)))
}

fn reason_label(reason: DenialReason) -> &'static str {
    match reason {
        DenialReason::PolicyInactive => "policy_inactive",
        DenialReason::ValidityExceeded => "validity_exceeded",
        DenialReason::ResourceNotAllowed => "resource_not_allowed",
        DenialReason::ActionNotAllowed => "action_not_allowed",
        DenialReason::DelegationNotAllowed => "delegation_not_allowed",
        DenialReason::DelegationDepthExceeded => "delegation_depth_exceeded",
        DenialReason::UnknownMandate => "unknown_mandate",
        DenialReason::Expired => "expired",
        DenialReason::NotYetValid => "not_yet_valid",
        DenialReason::Revoked => "revoked",
        DenialReason::ParentRevoked => "parent_revoked",
        DenialReason::SignatureInvalid => "signature_invalid",
        DenialReason::ActionOutOfScope => "action_out_of_scope",
        DenialReason::ResourceOutOfScope => "resource_out_of_scope",
        DenialReason::IntentMismatch => "intent_mismatch",
        DenialReason::RateLimited => "rate_limited",
        DenialReason::DownstreamUnavailable => "downstream_unavailable",
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
