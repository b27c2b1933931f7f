//! URL and header helpers
//!
//! Pure, total functions: every input yields a usable value, falling back to
//! a best-effort rendering when the input does not parse.

use url::{form_urlencoded, ParseError, Url};

/// Scheme assumed when a request carries none
pub const DEFAULT_SCHEME: &str = "http";

/// Header set by the edge proxy with the client-facing scheme
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

/// Canonical HTTP header casing: `x-foo-bar` becomes `X-Foo-Bar`.
///
/// Keys containing bytes that are not valid in a header field name (such as
/// HTTP/2 pseudo-headers like `:authority`) are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    if !key.bytes().all(is_token_byte) {
        return key.to_string();
    }

    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Fully qualify a raw request URL as sent on the native call.
///
/// Relative references resolve against `http://<host>/`. Anything that does
/// not parse is treated as a path on `host`.
pub fn full_url(raw: &str, host: &str) -> String {
    match Url::parse(raw) {
        Ok(url) if url.has_host() => return url.into(),
        Ok(_) => {}
        Err(ParseError::RelativeUrlWithoutBase) => {
            if let Ok(joined) = base_url(DEFAULT_SCHEME, host).and_then(|base| base.join(raw)) {
                return joined.into();
            }
        }
        Err(_) => {}
    }

    fallback_url(raw, host)
}

fn base_url(scheme: &str, host: &str) -> Result<Url, ParseError> {
    Url::parse(&format!("{}://{}/", scheme, host))
}

fn fallback_url(raw: &str, host: &str) -> String {
    let path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };

    match base_url(DEFAULT_SCHEME, host) {
        Ok(mut url) => {
            url.set_path(&path);
            url.into()
        }
        Err(_) => format!("{}://{}{}", DEFAULT_SCHEME, host, path),
    }
}

/// Assemble a URL from discrete request attributes.
///
/// An empty scheme becomes `http`. A query embedded in `path` is used when
/// `query` is empty, and dropped in favour of `query` otherwise.
pub fn assemble_url(scheme: &str, host: &str, path: &str, query: &str) -> String {
    let scheme = if scheme.is_empty() {
        DEFAULT_SCHEME
    } else {
        scheme
    };
    let (path, embedded) = path.split_once('?').unwrap_or((path, ""));
    let query = if query.is_empty() { embedded } else { query };

    match Url::parse(&format!("{}://{}", scheme, host)) {
        Ok(mut url) if url.has_host() => {
            url.set_path(path);
            url.set_query((!query.is_empty()).then_some(query));
            url.into()
        }
        _ => {
            let mut out = format!("{}://{}{}", scheme, host, path);
            if !query.is_empty() {
                out.push('?');
                out.push_str(query);
            }
            out
        }
    }
}

/// First scheme listed in an `X-Forwarded-Proto` value
pub fn forwarded_scheme(value: &str) -> Option<&str> {
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build the sign-in redirect for `request_url`.
///
/// The result keeps the request's scheme and authority, replaces the path with
/// `sign_in_path` and carries the original URL verbatim in `redirect_param`.
/// When `request_url` has no authority the redirect is host-relative.
pub fn sign_in_url(request_url: &str, sign_in_path: &str, redirect_param: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair(redirect_param, request_url)
        .finish();

    match Url::parse(request_url) {
        Ok(mut url) if url.has_host() => {
            url.set_path(sign_in_path);
            url.set_query(Some(&query));
            url.set_fragment(None);
            url.into()
        }
        _ => format!("{}?{}", sign_in_path, query),
    }
}
