//! Pure policy evaluation (spec §4.D). `evaluate_policy` touches no I/O and
//! returns the first failing check as a stable `DenialReason`; it never
//! partially applies a decision.

use crate::model::{AuthorityPolicy, ExecutionMandate};
use crate::reason::DenialReason;
use crate::{MandateId, Timestamp};

/// The fields of a requested mandate that the policy evaluator checks.
/// Distinct from `ExecutionMandate` because, at issuance time, the mandate
/// does not exist yet.
#[derive(Debug, Clone)]
pub struct MandateRequest<'a> {
    pub validity_seconds: u64,
    pub resource_scope: &'a [String],
    pub action_scope: &'a [String],
    pub parent_mandate_id: Option<MandateId>,
    pub delegation_depth: u32,
}

/// `allowed` covers `requested` iff every string matched by `requested`
/// would also be matched by `allowed`. Both are `/`-segmented glob
/// patterns; containment is decided segment by segment: a literal segment
/// in `allowed` must match the same literal segment in `requested`, `*`
/// matches any single segment, and a trailing `**` matches any number of
/// remaining segments (including zero).
pub fn pattern_covers(allowed: &str, requested: &str) -> bool {
    if allowed == requested || allowed == "**" {
        return true;
    }
    let allowed_segs: Vec<&str> = allowed.split('/').collect();
    let requested_segs: Vec<&str> = requested.split('/').collect();

    let mut ai = 0;
    let mut ri = 0;
    while ai < allowed_segs.len() {
        if allowed_segs[ai] == "**" {
            return true; // matches all remaining segments, however many
        }
        if ri >= requested_segs.len() {
            return false;
        }
        let a = allowed_segs[ai];
        let r = requested_segs[ri];
        let segment_ok = a == "*" || a == r || (a.contains('*') && glob_matches(a, r));
        if !segment_ok {
            return false;
        }
        ai += 1;
        ri += 1;
    }
    ai == allowed_segs.len() && ri == requested_segs.len()
}

fn glob_matches(pattern: &str, literal: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(literal))
        .unwrap_or(false)
}

/// Evaluate a mandate request against its issuer's active policy,
/// returning the first failing reason code, in the order spec §4.D names
/// them: policy active, validity window, resource scope, action scope,
/// delegation.
pub fn evaluate_policy(
    policy: &AuthorityPolicy,
    request: &MandateRequest<'_>,
) -> Result<(), DenialReason> {
    if !policy.active {
        return Err(DenialReason::PolicyInactive);
    }

    if request.validity_seconds > policy.max_validity_seconds {
        return Err(DenialReason::ValidityExceeded);
    }

    let resources_covered = request.resource_scope.iter().all(|requested| {
        policy
            .allowed_resource_patterns
            .iter()
            .any(|allowed| pattern_covers(allowed, requested))
    });
    if !resources_covered {
        return Err(DenialReason::ResourceNotAllowed);
    }

    let actions_covered = request
        .action_scope
        .iter()
        .all(|action| policy.allowed_actions.iter().any(|a| a == action));
    if !actions_covered {
        return Err(DenialReason::ActionNotAllowed);
    }

    if request.parent_mandate_id.is_some() {
        if !policy.delegation_allowed {
            return Err(DenialReason::DelegationNotAllowed);
        }
        if request.delegation_depth > policy.max_delegation_depth {
            return Err(DenialReason::DelegationDepthExceeded);
        }
    }

    Ok(())
}

/// Invariant 3: a delegated mandate's scopes and validity window must each
/// be covered by its parent's. `child_valid_until` is checked against the
/// parent's `valid_until` rather than the parent's policy, since a parent
/// mandate may itself have been delegated down from a broader grant.
/// Returns the first failing check's reason, mirroring `evaluate_policy`.
pub fn delegation_within_parent(
    parent: &ExecutionMandate,
    child_resource_scope: &[String],
    child_action_scope: &[String],
    child_valid_until: Timestamp,
) -> Result<(), DenialReason> {
    if child_valid_until > parent.valid_until {
        return Err(DenialReason::ValidityExceeded);
    }
    let resources_covered = child_resource_scope.iter().all(|requested| {
        parent
            .resource_scope
            .iter()
            .any(|allowed| pattern_covers(allowed, requested))
    });
    if !resources_covered {
        return Err(DenialReason::ResourceNotAllowed);
    }
    let actions_covered = child_action_scope
        .iter()
        .all(|action| parent.action_scope.iter().any(|a| a == action));
    if !actions_covered {
        return Err(DenialReason::ActionNotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_policy() -> AuthorityPolicy {
        AuthorityPolicy {
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
        }
    }

    #[test]
    fn permits_within_scope() {
        let policy = base_policy();
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:acme/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
        };
        assert!(evaluate_policy(&policy, &req).is_ok());
    }

    #[test]
    fn denies_inactive_policy() {
        let mut policy = base_policy();
        policy.active = false;
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:acme/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
        };
        assert_eq!(
            evaluate_policy(&policy, &req).unwrap_err(),
            DenialReason::PolicyInactive
        );
    }

    #[test]
    fn denies_resource_outside_pattern() {
        let policy = base_policy();
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:other/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
        };
        assert_eq!(
            evaluate_policy(&policy, &req).unwrap_err(),
            DenialReason::ResourceNotAllowed
        );
    }

    #[test]
    fn denies_validity_beyond_max() {
        let policy = base_policy();
        let req = MandateRequest {
            validity_seconds: 7200,
            resource_scope: &["repo:acme/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
        };
        assert_eq!(
            evaluate_policy(&policy, &req).unwrap_err(),
            DenialReason::ValidityExceeded
        );
    }

    #[test]
    fn denies_delegation_depth_exceeded() {
        let policy = base_policy();
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:acme/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: Some([2u8; 32]),
            delegation_depth: 3,
        };
        assert_eq!(
            evaluate_policy(&policy, &req).unwrap_err(),
            DenialReason::DelegationDepthExceeded
        );
    }

    #[test]
    fn denies_delegation_when_not_allowed() {
        let mut policy = base_policy();
        policy.delegation_allowed = false;
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:acme/widgets".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: Some([2u8; 32]),
            delegation_depth: 1,
        };
        assert_eq!(
            evaluate_policy(&policy, &req).unwrap_err(),
            DenialReason::DelegationNotAllowed
        );
    }

    #[test]
    fn double_star_covers_everything() {
        let mut policy = base_policy();
        policy.allowed_resource_patterns = vec!["**".into()];
        let req = MandateRequest {
            validity_seconds: 60,
            resource_scope: &["repo:whatever/deeply/nested".to_string()],
            action_scope: &["read".to_string()],
            parent_mandate_id: None,
            delegation_depth: 0,
        };
        assert!(evaluate_policy(&policy, &req).is_ok());
    }

    fn sample_parent() -> ExecutionMandate {
        ExecutionMandate {
            mandate_id: [9u8; 32],
            issuer_id: "root".into(),
            subject_id: "issuer-1".into(),
            valid_from: 0,
            valid_until: 10_000,
            resource_scope: vec!["repo:acme/*".into()],
            action_scope: vec!["read".into(), "write".into()],
            signature: [0u8; 64],
            created_at: 0,
            parent_mandate_id: None,
            delegation_depth: 0,
            revocation: crate::model::Revocation::active(),
            intent_hash: None,
        }
    }

    #[test]
    fn delegation_within_parent_accepts_narrower_grant() {
        let parent = sample_parent();
        assert_eq!(
            delegation_within_parent(
                &parent,
                &["repo:acme/widgets".to_string()],
                &["read".to_string()],
                5_000,
            ),
            Ok(())
        );
    }

    #[test]
    fn delegation_within_parent_rejects_wider_validity() {
        let parent = sample_parent();
        assert_eq!(
            delegation_within_parent(
                &parent,
                &["repo:acme/widgets".to_string()],
                &["read".to_string()],
                20_000,
            ),
            Err(DenialReason::ValidityExceeded)
        );
    }

    #[test]
    fn delegation_within_parent_rejects_resource_outside_parent_scope() {
        let parent = sample_parent();
        assert_eq!(
            delegation_within_parent(
                &parent,
                &["repo:other/widgets".to_string()],
                &["read".to_string()],
                5_000,
            ),
            Err(DenialReason::ResourceNotAllowed)
        );
    }

    #[test]
    fn delegation_within_parent_rejects_action_outside_parent_scope() {
        let parent = sample_parent();
        assert_eq!(
            delegation_within_parent(
                &parent,
                &["repo:acme/widgets".to_string()],
                &["delete".to_string()],
                5_000,
            ),
            Err(DenialReason::ActionNotAllowed)
        );
    }
}
