//! Canonical authorization request
//!
//! Both protocol surfaces normalize into [`CanonicalRequest`] before the
//! policy evaluator sees them:
//!
//! ```text
//! IsAuthorizedRequest (native) ──┐
//!                                ├──► CanonicalRequest ──► PolicyEvaluator
//! CheckRequest (ext_authz v3) ───┘
//! ```
//!
//! Normalization never fails; malformed input degrades to a best-effort value.

use std::collections::HashMap;

use envoy_types::ext_authz::v3::pb::CheckRequest;
use envoy_types::pb::envoy::config::core::v3::{address, socket_address};
use envoy_types::pb::envoy::service::auth::v3::attribute_context::{HttpRequest, Peer};
use gatehouse_proto::{is_authorized_request, IsAuthorizedRequest};
use serde::Serialize;

use crate::urlutil::{
    assemble_url, canonical_header_key, forwarded_scheme, full_url, FORWARDED_PROTO_HEADER,
};

/// Header name to ordered values, keys in canonical HTTP casing
pub type Headers = HashMap<String, Vec<String>>;

/// The single request shape handed to policy evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalRequest {
    /// Verified session token, empty for anonymous requests
    pub identity: String,
    /// Request headers
    pub headers: Headers,
    /// Host as sent by the client
    pub host: String,
    /// HTTP method
    pub method: String,
    /// Request target
    pub request_uri: String,
    /// Client network address
    pub remote_address: String,
    /// Fully qualified request URL; always has a scheme and host
    pub url: String,
}

impl CanonicalRequest {
    /// Normalize a native `IsAuthorized` call.
    ///
    /// The identity token was resolved by the caller and is taken as-is.
    pub fn from_native(req: &IsAuthorizedRequest) -> Self {
        Self {
            identity: req.user_token.clone(),
            headers: clone_headers(&req.request_headers),
            host: req.request_host.clone(),
            method: req.request_method.clone(),
            request_uri: req.request_request_uri.clone(),
            remote_address: req.request_remote_addr.clone(),
            url: full_url(&req.request_url, &req.request_host),
        }
    }

    /// Normalize an ext_authz `Check` call.
    ///
    /// The identity is left empty; attach it with [`Self::with_identity`] once
    /// the session has been resolved from [`Self::headers`].
    pub fn from_check(req: &CheckRequest) -> Self {
        let http = check_http(req);
        let url = check_request_url(req);

        Self {
            identity: String::new(),
            headers: check_request_headers(req),
            host: http.map(|h| h.host.clone()).unwrap_or_default(),
            method: http.map(|h| h.method.clone()).unwrap_or_default(),
            request_uri: url.clone(),
            remote_address: peer_address(
                req.attributes.as_ref().and_then(|a| a.source.as_ref()),
            ),
            url,
        }
    }

    /// Attach the resolved session token
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// First value of a header, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

/// Deep-copy native headers into canonical casing.
///
/// Keys that collide after canonicalization are merged in key order.
fn clone_headers(input: &HashMap<String, is_authorized_request::Headers>) -> Headers {
    let mut keys: Vec<&String> = input.keys().collect();
    keys.sort();

    let mut out = Headers::with_capacity(input.len());
    for key in keys {
        out.entry(canonical_header_key(key))
            .or_default()
            .extend(input[key].value.iter().cloned());
    }
    out
}

fn check_http(req: &CheckRequest) -> Option<&HttpRequest> {
    req.attributes
        .as_ref()
        .and_then(|a| a.request.as_ref())
        .and_then(|r| r.http.as_ref())
}

/// Headers of an ext_authz request, one value per canonical key
pub fn check_request_headers(req: &CheckRequest) -> Headers {
    let mut out = Headers::new();
    if let Some(http) = check_http(req) {
        for (k, v) in &http.headers {
            out.entry(canonical_header_key(k))
                .or_default()
                .push(v.clone());
        }
    }
    out
}

/// Client-facing URL of an ext_authz request.
///
/// `X-Forwarded-Proto` overrides the scheme attribute because TLS is
/// terminated in front of the proxy.
pub fn check_request_url(req: &CheckRequest) -> String {
    let Some(http) = check_http(req) else {
        return assemble_url("", "", "", "");
    };

    let scheme = http
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(FORWARDED_PROTO_HEADER))
        .and_then(|(_, v)| forwarded_scheme(v))
        .unwrap_or(&http.scheme);

    assemble_url(scheme, &http.host, &http.path, &http.query)
}

/// `ip:port` of an ext_authz peer, empty when unknown
fn peer_address(peer: Option<&Peer>) -> String {
    let Some(addr) = peer
        .and_then(|p| p.address.as_ref())
        .and_then(|a| a.address.as_ref())
    else {
        return String::new();
    };

    match addr {
        address::Address::SocketAddress(sa) => {
            let host = if sa.address.contains(':') {
                format!("[{}]", sa.address)
            } else {
                sa.address.clone()
            };
            match &sa.port_specifier {
                Some(socket_address::PortSpecifier::PortValue(port)) => {
                    format!("{}:{}", host, port)
                }
                Some(socket_address::PortSpecifier::NamedPort(name)) => {
                    format!("{}:{}", host, name)
                }
                None => host,
            }
        }
        address::Address::Pipe(pipe) => pipe.path.clone(),
        #[allow(unreachable_patterns)]
        _ => String::new(),
    }
}
