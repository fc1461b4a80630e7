use std::sync::Arc;

use authority_bus::{EventBus, Producer, ProducerConfig};
use authority_core::cache::MandateCache;
use authority_core::store::{InMemoryStore, MandateStore};
use authority_engine::{
    AuthorityEngine, DelegateRequest, EngineConfig, IssueOutcome, IssueRequest, RevokeOutcome,
    RevokeRequest, ValidateOutcome, ValidateRequest,
};
use authority_spec::{self as spec, AuthorityPolicy, DenialReason, Principal, PrincipalKind};
use ed25519_dalek::SigningKey;

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

async fn seed_principal(
    store: &InMemoryStore,
    id: &str,
    signing_key: &SigningKey,
    allowed_resources: &[&str],
    allowed_actions: &[&str],
    delegation_allowed: bool,
) {
    let principal = Principal {
        id: id.to_string(),
        name: id.to_string(),
        kind: PrincipalKind::Agent,
        parent_id: None,
        public_key: signing_key.verifying_key().to_bytes(),
        created_at: 0,
        metadata: serde_json::Value::Null,
        active: true,
    };
    store.put_principal(principal).await.unwrap();
    let policy = AuthorityPolicy {
        policy_id: spec::derive_mandate_id(
            &spec::MandateFields {
                issuer_id: id,
                subject_id: id,
                valid_from: 0,
                valid_until: 0,
                resource_scope: &[],
                action_scope: &[],
                parent_mandate_id: None,
                delegation_depth: 0,
                intent_hash: None,
            },
            0,
        ),
        principal_id: id.to_string(),
        allowed_resource_patterns: allowed_resources.iter().map(|s| s.to_string()).collect(),
        allowed_actions: allowed_actions.iter().map(|s| s.to_string()).collect(),
        max_validity_seconds: 3600,
        delegation_allowed,
        max_delegation_depth: 3,
        active: true,
        created_at: 0,
        creator: "admin".into(),
        version: 1,
    };
    store.put_policy(policy).await.unwrap();
}

#[tokio::test]
async fn cascading_revoke_denies_validation_on_every_descendant() {
    let (engine, store) = engine();
    let (root_key, _) = spec::generate_keypair();
    let (child_key, _) = spec::generate_keypair();
    seed_principal(&store, "root-agent", &root_key, &["repo:acme/*"], &["read", "write"], true).await;
    // "child-agent" becomes the delegating issuer once it holds a mandate,
    // so it needs its own registered key and a policy permitting further
    // delegation.
    seed_principal(&store, "child-agent", &child_key, &["repo:acme/*"], &["read", "write"], true).await;

    let IssueOutcome::Issued(root_mandate) = engine
        .issue(
            IssueRequest {
                issuer_id: "root-agent".into(),
                subject_id: "child-agent".into(),
                resource_scope: vec!["repo:acme/widgets".into()],
                action_scope: vec!["read".into()],
                validity_seconds: 600,
                intent: None,
                parent_mandate_id: None,
                correlation_id: None,
                metadata: None,
            },
            &root_key,
        )
        .await
    else {
        panic!("expected root mandate to be issued");
    };

    let IssueOutcome::Issued(child_mandate) = engine
        .delegate(
            DelegateRequest {
                parent_mandate_id: root_mandate.mandate_id,
                child_subject_id: "grandchild-agent".into(),
                resource_scope: vec!["repo:acme/widgets".into()],
                action_scope: vec!["read".into()],
                validity_seconds: 300,
                correlation_id: None,
            },
            &child_key,
        )
        .await
    else {
        panic!("expected delegated mandate to be issued");
    };

    let outcome = engine
        .revoke(RevokeRequest {
            mandate_id: root_mandate.mandate_id,
            revoker_id: "root-agent".into(),
            reason: "compromised credential".into(),
            cascade: true,
        })
        .await;
    let RevokeOutcome::Revoked { revoked_ids, .. } = outcome else {
        panic!("expected revoke to succeed");
    };
    assert_eq!(revoked_ids.len(), 2);

    let root_validation = engine
        .validate(ValidateRequest {
            mandate_id: root_mandate.mandate_id,
            requested_action: "read".into(),
            requested_resource: "repo:acme/widgets".into(),
            correlation_id: "corr-1".into(),
            intent: None,
        })
        .await;
    assert!(matches!(root_validation, ValidateOutcome::Denied(DenialReason::Revoked)));

    let child_validation = engine
        .validate(ValidateRequest {
            mandate_id: child_mandate.mandate_id,
            requested_action: "read".into(),
            requested_resource: "repo:acme/widgets".into(),
            correlation_id: "corr-2".into(),
            intent: None,
        })
        .await;
    assert!(matches!(
        child_validation,
        ValidateOutcome::Denied(DenialReason::Revoked | DenialReason::ParentRevoked)
    ));
}

#[tokio::test]
async fn delegation_denied_when_policy_forbids_it() {
    let (engine, store) = engine();
    let (issuer_key, _) = spec::generate_keypair();
    let (worker_key, _) = spec::generate_keypair();
    seed_principal(&store, "issuer-agent", &issuer_key, &["repo:acme/*"], &["read"], true).await;
    // The worker holds its own policy with delegation disabled; once it
    // holds a mandate it becomes the issuer for any further delegation.
    seed_principal(&store, "worker-agent", &worker_key, &["repo:acme/*"], &["read"], false).await;

    let IssueOutcome::Issued(mandate) = engine
        .issue(
            IssueRequest {
                issuer_id: "issuer-agent".into(),
                subject_id: "worker-agent".into(),
                resource_scope: vec!["repo:acme/widgets".into()],
                action_scope: vec!["read".into()],
                validity_seconds: 600,
                intent: None,
                parent_mandate_id: None,
                correlation_id: None,
                metadata: None,
            },
            &issuer_key,
        )
        .await
    else {
        panic!("expected issue to succeed");
    };

    let outcome = engine
        .delegate(
            DelegateRequest {
                parent_mandate_id: mandate.mandate_id,
                child_subject_id: "sub-worker".into(),
                resource_scope: vec!["repo:acme/widgets".into()],
                action_scope: vec!["read".into()],
                validity_seconds: 300,
                correlation_id: None,
            },
            &worker_key,
        )
        .await;

    assert!(matches!(
        outcome,
        IssueOutcome::Denied(DenialReason::DelegationNotAllowed)
    ));
}
