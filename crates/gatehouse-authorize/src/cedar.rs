//! Cedar policy evaluator
//!
//! The built-in [`PolicyEvaluator`] used by the `gatehouse` binary.
//!
//! # Entity Model
//!
//! ```text
//! Gatehouse::User::"<sub>"          (principal, parents: Gatehouse::Group, attr email)
//! Gatehouse::User::"anonymous"      (principal without a verified session)
//! Gatehouse::Group::"<group>"       (principal parent)
//! Gatehouse::Action::"<METHOD>"     (action, upper-cased HTTP method)
//! Gatehouse::Route::"<host>"        (resource, attrs host, path)
//! ```
//!
//! Context: `method`, `path`, `scheme`, `remote_address`, `authenticated`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cedar_policy::{
    Authorizer, Context, Decision as CedarDecision, Effect, Entities, Entity, EntityId,
    EntityTypeName, EntityUid, PolicySet, Request, RestrictedExpression,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SharedSnapshot;
use crate::error::{Error, Result};
use crate::evaluator::{Decision, PolicyEvaluator};
use crate::request::CanonicalRequest;
use crate::session::SessionClaims;

/// Cedar schema namespace
const NAMESPACE: &str = "Gatehouse";

/// Principal id for requests without a verified session
pub const ANONYMOUS: &str = "anonymous";

/// Deny reason when no permit policy matched
pub const NO_PERMIT_REASON: &str = "no policy permits the request";

/// Evaluates canonical requests against a Cedar policy set
pub struct CedarEvaluator {
    authorizer: Authorizer,
    policy_set: RwLock<Arc<PolicySet>>,
    snapshot: SharedSnapshot,
}

impl CedarEvaluator {
    /// Evaluator with no policies (default-deny)
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self {
            authorizer: Authorizer::new(),
            policy_set: RwLock::new(Arc::new(PolicySet::new())),
            snapshot,
        }
    }

    /// Evaluator with explicit policy text
    pub fn with_policies(policy_text: &str, snapshot: SharedSnapshot) -> Result<Self> {
        let evaluator = Self::new(snapshot);
        evaluator.reload(policy_text)?;
        Ok(evaluator)
    }

    /// Replace the policy set; on error the current set is kept
    pub fn reload(&self, policy_text: &str) -> Result<()> {
        let policy_set = parse_policies(policy_text)?;
        let count = policy_set.policies().count();
        *self.policy_set.write() = Arc::new(policy_set);
        info!(policies = count, "Loaded Cedar policies");
        Ok(())
    }

    /// Replace the policy set from a file
    pub fn reload_file(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::policy(format!("failed to read {}: {}", path.display(), e)))?;
        self.reload(&text)
    }

    /// Number of loaded policies
    pub fn policy_count(&self) -> usize {
        self.policy_set.read().policies().count()
    }

    /// Verified claims behind the request identity, if any
    ///
    /// A session without a subject names nobody and evaluates as anonymous.
    fn claims(&self, identity: &str) -> Option<SessionClaims> {
        if identity.is_empty() {
            return None;
        }
        let snapshot = self.snapshot.load();
        let verified = snapshot
            .session_store()
            .and_then(|store| store.signer().verify(identity));
        match verified {
            Ok(claims) if claims.sub.as_deref().is_some_and(|s| !s.is_empty()) => Some(claims),
            Ok(_) => {
                debug!("Session has no subject; evaluating as anonymous");
                None
            }
            Err(e) => {
                debug!(error = %e, "Identity did not verify; evaluating as anonymous");
                None
            }
        }
    }

    fn evaluate(&self, request: &CanonicalRequest) -> Result<Decision> {
        let claims = self.claims(&request.identity);
        let target = RouteTarget::from_request(request);

        let principal_id = claims
            .as_ref()
            .and_then(|c| c.sub.as_deref())
            .unwrap_or(ANONYMOUS);
        let principal = build_entity_uid("User", principal_id)?;
        let action = build_entity_uid("Action", &target.method)?;
        let resource = build_entity_uid("Route", &target.host)?;

        let mut entity_vec = build_user_entity(principal_id, claims.as_ref())?;
        entity_vec.push(build_route_entity(&target)?);
        let entities = Entities::from_entities(entity_vec, None)
            .map_err(|e| Error::evaluation(format!("failed to create entities set: {}", e)))?;

        let context = build_context(&target, &request.remote_address, claims.is_some())?;
        let cedar_request = Request::new(
            principal.clone(),
            action.clone(),
            resource.clone(),
            context,
            None,
        )
        .map_err(|e| Error::evaluation(format!("failed to build Cedar request: {}", e)))?;

        let policy_set = self.policy_set.read().clone();
        let response = self
            .authorizer
            .is_authorized(&cedar_request, &policy_set, &entities);

        for err in response.diagnostics().errors() {
            warn!(error = %err, "Cedar policy evaluation error");
        }

        debug!(
            principal = %principal,
            action = %action,
            resource = %resource,
            decision = ?response.decision(),
            "Cedar authorization result"
        );

        match response.decision() {
            CedarDecision::Allow => Ok(Decision::allow()),
            CedarDecision::Deny => {
                let forbidding: Vec<String> = response
                    .diagnostics()
                    .reason()
                    .filter(|id| {
                        policy_set
                            .policy(id)
                            .is_some_and(|p| p.effect() == Effect::Forbid)
                    })
                    .map(|id| format!("denied by policy {}", id))
                    .collect();

                if forbidding.is_empty() {
                    Ok(Decision::deny([NO_PERMIT_REASON]))
                } else {
                    Ok(Decision::deny(forbidding))
                }
            }
        }
    }
}

#[async_trait]
impl PolicyEvaluator for CedarEvaluator {
    async fn is_authorized(&self, request: &CanonicalRequest) -> Result<Decision> {
        self.evaluate(request)
    }
}

fn parse_policies(text: &str) -> Result<PolicySet> {
    text.parse()
        .map_err(|e: cedar_policy::ParseErrors| {
            Error::policy(format!("invalid Cedar policy: {}", e))
        })
}

/// Request attributes Cedar sees
struct RouteTarget {
    method: String,
    host: String,
    path: String,
    scheme: String,
}

impl RouteTarget {
    fn from_request(request: &CanonicalRequest) -> Self {
        let url = Url::parse(&request.url).ok();
        let method = if request.method.is_empty() {
            "GET".to_string()
        } else {
            request.method.to_ascii_uppercase()
        };
        let host = if request.host.is_empty() {
            url.as_ref()
                .and_then(|u| u.host_str())
                .unwrap_or_default()
                .to_string()
        } else {
            request.host.clone()
        };

        Self {
            method,
            host,
            path: url
                .as_ref()
                .map(|u| u.path().to_string())
                .unwrap_or_else(|| "/".to_string()),
            scheme: url
                .as_ref()
                .map(|u| u.scheme().to_string())
                .unwrap_or_else(|| "http".to_string()),
        }
    }
}

/// Build an entity UID in the Gatehouse namespace
fn build_entity_uid(type_name: &str, id: &str) -> Result<EntityUid> {
    let full_type_name = format!("{}::{}", NAMESPACE, type_name);
    let entity_type: EntityTypeName =
        full_type_name
            .parse()
            .map_err(|e: cedar_policy::ParseErrors| {
                Error::evaluation(format!(
                    "invalid Cedar entity type name '{}': {}",
                    full_type_name, e
                ))
            })?;
    Ok(EntityUid::from_type_name_and_id(
        entity_type,
        EntityId::new(id),
    ))
}

/// User entity plus one entity per group the user belongs to
fn build_user_entity(user: &str, claims: Option<&SessionClaims>) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();

    let groups = claims.map(|c| c.groups.as_slice()).unwrap_or_default();
    let mut group_uids = HashSet::new();
    for group in groups {
        let uid = build_entity_uid("Group", group)?;
        if !group_uids.insert(uid.clone()) {
            continue;
        }
        let entity = Entity::new(uid, HashMap::new(), HashSet::new())
            .map_err(|e| Error::evaluation(format!("failed to create group entity: {}", e)))?;
        entities.push(entity);
    }

    let mut attrs = HashMap::new();
    if let Some(email) = claims.and_then(|c| c.email.as_ref()) {
        attrs.insert(
            "email".to_string(),
            RestrictedExpression::new_string(email.clone()),
        );
    }

    let user = Entity::new(build_entity_uid("User", user)?, attrs, group_uids)
        .map_err(|e| Error::evaluation(format!("failed to create user entity: {}", e)))?;
    entities.push(user);

    Ok(entities)
}

fn build_route_entity(target: &RouteTarget) -> Result<Entity> {
    let mut attrs = HashMap::new();
    attrs.insert(
        "host".to_string(),
        RestrictedExpression::new_string(target.host.clone()),
    );
    attrs.insert(
        "path".to_string(),
        RestrictedExpression::new_string(target.path.clone()),
    );

    Entity::new(build_entity_uid("Route", &target.host)?, attrs, HashSet::new())
        .map_err(|e| Error::evaluation(format!("failed to create route entity: {}", e)))
}

fn build_context(
    target: &RouteTarget,
    remote_address: &str,
    authenticated: bool,
) -> Result<Context> {
    let pairs = vec![
        (
            "method".to_string(),
            RestrictedExpression::new_string(target.method.clone()),
        ),
        (
            "path".to_string(),
            RestrictedExpression::new_string(target.path.clone()),
        ),
        (
            "scheme".to_string(),
            RestrictedExpression::new_string(target.scheme.clone()),
        ),
        (
            "remote_address".to_string(),
            RestrictedExpression::new_string(remote_address.to_string()),
        ),
        (
            "authenticated".to_string(),
            RestrictedExpression::new_bool(authenticated),
        ),
    ];

    Context::from_pairs(pairs)
        .map_err(|e| Error::evaluation(format!("failed to build Cedar context: {}", e)))
}
