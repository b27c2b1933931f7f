//! Decision mapper
//!
//! Combines a policy [`Decision`] with the session resolution result into
//! exactly one [`Outcome`], and renders that outcome as an ext_authz response.
//!
//! ```text
//! allow ───────────────────────────────► Allowed
//! deny + recoverable session error ────► DeniedUnauthenticatedRedirect(location)
//! deny + anything else ────────────────► DeniedForbidden(message)
//! ```

use envoy_types::ext_authz::v3::pb::CheckResponse;
use envoy_types::ext_authz::v3::CheckResponseExt;
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::{
    check_response, DeniedHttpResponse, OkHttpResponse,
};
use tonic::Status;

use crate::config::Options;
use crate::evaluator::Decision;
use crate::session::{classify, SessionError, SessionStatus};
use crate::urlutil::sign_in_url;

/// Header carrying the sign-in redirect target
pub const LOCATION_HEADER: &str = "Location";

/// Terminal result of one authorization call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Request may proceed
    Allowed,
    /// Request is rejected; carries the message reported to the proxy
    DeniedForbidden(String),
    /// Caller must sign in again; carries the sign-in URL
    DeniedUnauthenticatedRedirect(String),
}

impl Outcome {
    /// Map a policy decision and the session resolution result to an outcome.
    ///
    /// A permitting policy wins over any session error, so routes open to
    /// anonymous users stay reachable without a valid session.
    pub fn decide(
        decision: &Decision,
        session_error: Option<&SessionError>,
        request_url: &str,
        options: &Options,
    ) -> Self {
        if decision.allow {
            return Outcome::Allowed;
        }

        match (classify(session_error), session_error) {
            (SessionStatus::Recoverable, _) => Outcome::DeniedUnauthenticatedRedirect(
                sign_in_url(
                    request_url,
                    &options.sign_in_path,
                    &options.redirect_query_param,
                ),
            ),
            (_, Some(err)) => Outcome::DeniedForbidden(err.to_string()),
            (_, None) => Outcome::DeniedForbidden(String::new()),
        }
    }

    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::DeniedForbidden(_) => "forbidden",
            Outcome::DeniedUnauthenticatedRedirect(_) => "redirect",
        }
    }

    /// Render as an Envoy ext_authz v3 response
    pub fn into_check_response(self) -> CheckResponse {
        match self {
            Outcome::Allowed => {
                let mut response = CheckResponse::with_status(Status::ok("OK"));
                response.http_response = Some(check_response::HttpResponse::OkResponse(
                    OkHttpResponse::default(),
                ));
                response
            }
            Outcome::DeniedForbidden(message) => {
                let mut response = CheckResponse::with_status(Status::permission_denied(message));
                response.http_response = Some(denied(StatusCode::Forbidden, Vec::new()));
                response
            }
            Outcome::DeniedUnauthenticatedRedirect(location) => {
                let mut response =
                    CheckResponse::with_status(Status::unauthenticated("unauthenticated"));
                let headers = vec![HeaderValueOption {
                    header: Some(HeaderValue {
                        key: LOCATION_HEADER.to_string(),
                        value: location,
                        ..Default::default()
                    }),
                    ..Default::default()
                }];
                response.http_response = Some(denied(StatusCode::Found, headers));
                response
            }
        }
    }
}

fn denied(code: StatusCode, headers: Vec<HeaderValueOption>) -> check_response::HttpResponse {
    check_response::HttpResponse::DeniedResponse(DeniedHttpResponse {
        status: Some(HttpStatus { code: code as i32 }),
        headers,
        ..Default::default()
    })
}
