//! Authorize gRPC server
//!
//! Serves the native `IsAuthorized` call and the Envoy ext_authz `Check`
//! call from one listener. Both normalize into a [`CanonicalRequest`] and
//! share the same evaluator and configuration snapshot.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::ext_authz::v3::pb::{
    Authorization, AuthorizationServer, CheckRequest, CheckResponse,
};
use gatehouse_proto::authorizer_server::{Authorizer, AuthorizerServer};
use gatehouse_proto::{IsAuthorizedReply, IsAuthorizedRequest};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::config::SharedSnapshot;
use crate::decision::Outcome;
use crate::error::{Error, Result};
use crate::evaluator::{evaluate, PolicyEvaluator};
use crate::request::CanonicalRequest;

/// Message reported to the proxy when the evaluator fails
pub const EVALUATION_FAILED_MESSAGE: &str = "policy evaluation failed";

/// gRPC metadata key carrying the caller's deadline
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Time kept back from the caller's deadline to write the response
const CALLER_DEADLINE_HEADROOM: Duration = Duration::from_millis(5);

/// Authorize gRPC server
pub struct AuthorizeServer {
    service: AuthorizeService,
    addr: SocketAddr,
}

impl AuthorizeServer {
    /// Create a server for `service` listening on `addr`
    pub fn new(service: AuthorizeService, addr: SocketAddr) -> Self {
        Self { service, addr }
    }

    /// Serve both gRPC services until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.addr;
        info!(?addr, "Starting authorize gRPC server");

        tonic::transport::Server::builder()
            .add_service(AuthorizationServer::new(self.service.clone()))
            .add_service(AuthorizerServer::new(self.service))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| Error::grpc(format!("server error: {}", e)))
    }
}

/// Handler for both authorization surfaces
#[derive(Clone)]
pub struct AuthorizeService {
    snapshot: SharedSnapshot,
    evaluator: Arc<dyn PolicyEvaluator>,
}

impl AuthorizeService {
    /// Create a service reading configuration from `snapshot`
    pub fn new(snapshot: SharedSnapshot, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            snapshot,
            evaluator,
        }
    }

    /// Resolve the session, evaluate and map the result to an ext_authz response.
    ///
    /// Evaluation runs under the configured deadline or the caller's, whichever
    /// is shorter. Evaluator failures become a forbidden response; the proxy
    /// always gets a well-formed answer.
    async fn do_check(&self, request: &CheckRequest, caller: Option<Duration>) -> Outcome {
        let snapshot = self.snapshot.load();
        let canonical = CanonicalRequest::from_check(request);

        let (identity, session_error) = match snapshot.load_session(&canonical.headers) {
            Ok(token) => (token, None),
            Err(e) => {
                debug!(error = %e, url = %canonical.url, "No valid session");
                (String::new(), Some(e))
            }
        };
        let canonical = canonical.with_identity(identity);

        let timeout = effective_timeout(snapshot.options().evaluation_timeout(), caller);
        let decision = match evaluate(self.evaluator.as_ref(), &canonical, timeout).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, url = %canonical.url, "Policy evaluation failed");
                return Outcome::DeniedForbidden(EVALUATION_FAILED_MESSAGE.to_string());
            }
        };

        let outcome = Outcome::decide(
            &decision,
            session_error.as_ref(),
            &canonical.url,
            snapshot.options(),
        );

        debug!(
            method = %canonical.method,
            url = %canonical.url,
            allow = decision.allow,
            deny_reasons = ?decision.deny_reasons,
            outcome = outcome.as_str(),
            "Authorization decision"
        );

        outcome
    }
}

#[tonic::async_trait]
impl Authorization for AuthorizeService {
    #[instrument(skip(self, request), fields(otel.kind = "server"))]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        let caller = caller_timeout(request.metadata());
        let outcome = self.do_check(request.get_ref(), caller).await;
        Ok(Response::new(outcome.into_check_response()))
    }
}

#[tonic::async_trait]
impl Authorizer for AuthorizeService {
    #[instrument(skip(self, request), fields(otel.kind = "server"))]
    async fn is_authorized(
        &self,
        request: Request<IsAuthorizedRequest>,
    ) -> std::result::Result<Response<IsAuthorizedReply>, Status> {
        let canonical = CanonicalRequest::from_native(request.get_ref());
        let timeout = effective_timeout(
            self.snapshot.load().options().evaluation_timeout(),
            caller_timeout(request.metadata()),
        );

        let decision = evaluate(self.evaluator.as_ref(), &canonical, timeout)
            .await
            .map_err(|e| {
                warn!(error = %e, url = %canonical.url, "Policy evaluation failed");
                Status::from(e)
            })?;

        debug!(
            method = %canonical.method,
            url = %canonical.url,
            allow = decision.allow,
            deny_reasons = ?decision.deny_reasons,
            "Authorization decision"
        );

        Ok(Response::new(IsAuthorizedReply {
            allow: decision.allow,
            deny_reasons: decision.deny_reasons,
        }))
    }
}

/// The configured deadline, shortened to fit inside the caller's
fn effective_timeout(configured: Duration, caller: Option<Duration>) -> Duration {
    match caller {
        Some(caller) => configured.min(caller.saturating_sub(CALLER_DEADLINE_HEADROOM)),
        None => configured,
    }
}

/// Parse the `grpc-timeout` header: up to eight digits and a unit
/// (`H`, `M`, `S`, `m`, `u` or `n`)
fn caller_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get(GRPC_TIMEOUT_HEADER)?.to_str().ok()?;
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        debug!(value = %value, "Ignoring malformed grpc-timeout");
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 60 * 60)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => {
            debug!(value = %value, "Ignoring grpc-timeout with unknown unit");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::tests::valid_options;
    use crate::evaluator::{Decision, MockPolicyEvaluator};
    use crate::request::tests::check_request;
    use crate::session::SessionClaims;

    fn service(mock: MockPolicyEvaluator) -> AuthorizeService {
        AuthorizeService::new(SharedSnapshot::new(valid_options()), Arc::new(mock))
    }

    fn session_cookie(service: &AuthorizeService) -> String {
        let snapshot = service.snapshot.load();
        let store = snapshot.session_store().unwrap();
        let token = store
            .signer()
            .sign(&SessionClaims::new("alice", Duration::from_secs(600)))
            .unwrap();
        format!("_gatehouse={}", token)
    }

    #[tokio::test]
    async fn test_check_attaches_verified_identity() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .withf(|r| !r.identity.is_empty())
            .times(1)
            .returning(|_| Ok(Decision::allow()));
        let service = service(mock);
        let cookie = session_cookie(&service);

        let req = check_request("https", "app.example.com", "/", &[("cookie", cookie.as_str())]);
        assert_eq!(service.do_check(&req, None).await, Outcome::Allowed);
    }

    #[tokio::test]
    async fn test_check_without_session_redirects_on_deny() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .withf(|r| r.identity.is_empty())
            .returning(|_| Ok(Decision::deny(["no policy permits the request"])));
        let service = service(mock);

        let req = check_request("http", "app.example.com", "/private", &[]);
        let outcome = service.do_check(&req, None).await;
        assert!(matches!(outcome, Outcome::DeniedUnauthenticatedRedirect(_)));
    }

    #[tokio::test]
    async fn test_check_valid_session_denied_is_forbidden() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .returning(|_| Ok(Decision::deny(["no policy permits the request"])));
        let service = service(mock);
        let cookie = session_cookie(&service);

        let req = check_request("https", "app.example.com", "/", &[("cookie", cookie.as_str())]);
        assert_eq!(
            service.do_check(&req, None).await,
            Outcome::DeniedForbidden(String::new())
        );
    }

    #[tokio::test]
    async fn test_check_evaluator_error_is_forbidden() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .returning(|_| Err(Error::evaluation("backend unavailable")));
        let service = service(mock);

        let response = service
            .check(Request::new(check_request("https", "app.example.com", "/", &[])))
            .await
            .unwrap()
            .into_inner();

        let status = response.status.unwrap();
        assert_eq!(status.code, tonic::Code::PermissionDenied as i32);
        assert_eq!(status.message, EVALUATION_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn test_native_evaluator_error_is_status() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .returning(|_| Err(Error::evaluation("backend unavailable")));
        let service = service(mock);

        let status = service
            .is_authorized(Request::new(IsAuthorizedRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_native_passes_token_through() {
        let mut mock = MockPolicyEvaluator::new();
        mock.expect_is_authorized()
            .withf(|r| r.identity == "opaque-token" && r.url == "http://a.com/foo?x=1")
            .returning(|_| Ok(Decision::deny(["denied by policy policy0"])));
        let service = service(mock);

        let reply = service
            .is_authorized(Request::new(IsAuthorizedRequest {
                user_token: "opaque-token".to_string(),
                request_url: "/foo?x=1".to_string(),
                request_host: "a.com".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!reply.allow);
        assert_eq!(reply.deny_reasons, vec!["denied by policy policy0"]);
    }

    fn metadata(timeout: &str) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, timeout.parse().unwrap());
        metadata
    }

    #[test]
    fn test_caller_timeout_units() {
        assert_eq!(caller_timeout(&metadata("1H")), Some(Duration::from_secs(3600)));
        assert_eq!(caller_timeout(&metadata("2M")), Some(Duration::from_secs(120)));
        assert_eq!(caller_timeout(&metadata("3S")), Some(Duration::from_secs(3)));
        assert_eq!(caller_timeout(&metadata("250m")), Some(Duration::from_millis(250)));
        assert_eq!(caller_timeout(&metadata("40u")), Some(Duration::from_micros(40)));
        assert_eq!(caller_timeout(&metadata("99999999n")), Some(Duration::from_nanos(99_999_999)));
    }

    #[test]
    fn test_caller_timeout_rejects_malformed() {
        assert_eq!(caller_timeout(&MetadataMap::new()), None);
        assert_eq!(caller_timeout(&metadata("m")), None);
        assert_eq!(caller_timeout(&metadata("10x")), None);
        assert_eq!(caller_timeout(&metadata("-5m")), None);
        assert_eq!(caller_timeout(&metadata("123456789m")), None);
    }

    #[test]
    fn test_effective_timeout_takes_shorter_deadline() {
        let configured = Duration::from_secs(2);
        assert_eq!(effective_timeout(configured, None), configured);
        assert_eq!(
            effective_timeout(configured, Some(Duration::from_millis(50))),
            Duration::from_millis(45)
        );
        assert_eq!(
            effective_timeout(configured, Some(Duration::from_secs(30))),
            configured
        );
        assert_eq!(
            effective_timeout(configured, Some(Duration::from_millis(1))),
            Duration::ZERO
        );
    }
}
