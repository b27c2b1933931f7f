//! Cookie-backed session store
//!
//! Session tokens can outgrow the per-cookie size limit browsers enforce, so
//! they are written as up to [`MAX_CHUNKS`] cookies: `<name>`, `<name>_1`,
//! `<name>_2`, ... and reassembled in order on load. Every chunk but the last
//! is exactly [`CHUNK_SIZE`] bytes, so a shorter value ends the session even
//! when a stale continuation cookie is still present.

use std::time::Duration;

use tracing::debug;

use super::{SessionError, Signer};
use crate::request::Headers;

/// Largest value written into a single cookie
pub const CHUNK_SIZE: usize = 3800;

/// Maximum number of cookies one session may span
pub const MAX_CHUNKS: usize = 5;

/// Session cookie policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    /// Cookie name
    pub name: String,
    /// Cookie domain, empty for host-only cookies
    pub domain: String,
    /// Restrict the cookie to HTTPS
    pub secure: bool,
    /// Hide the cookie from scripts
    pub http_only: bool,
    /// Cookie lifetime
    pub expire: Duration,
}

/// Loads and renders session cookies, verifying tokens with a [`Signer`]
#[derive(Debug, Clone)]
pub struct CookieStore {
    options: CookieOptions,
    signer: Signer,
}

impl CookieStore {
    /// Create a store; fails with [`SessionError::Other`] when the cookie name is empty
    pub fn new(options: CookieOptions, signer: Signer) -> Result<Self, SessionError> {
        if options.name.is_empty() {
            return Err(SessionError::other("cookie: name is required"));
        }
        Ok(Self { options, signer })
    }

    /// Cookie policy this store was built with
    pub fn options(&self) -> &CookieOptions {
        &self.options
    }

    /// Signer used to verify and mint session tokens
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Find the session cookie in `headers` and return the verified raw token.
    ///
    /// Every cookie carrying the session name is tried in order; the first one
    /// that verifies wins. When none verifies, the first failure is returned.
    pub fn load_session(&self, headers: &Headers) -> Result<String, SessionError> {
        let cookies = request_cookies(headers);
        let name = self.options.name.as_str();

        let mut first_error = None;
        for (_, value) in cookies.iter().filter(|(n, _)| *n == name) {
            let token = reassemble(&cookies, name, value);
            if token.is_empty() {
                continue;
            }
            match self.signer.verify(&token) {
                Ok(_) => return Ok(token),
                Err(e) => {
                    debug!(cookie = %name, error = %e, "Session cookie failed verification");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or(SessionError::NoSessionFound))
    }

    /// Render `Set-Cookie` header values carrying `token`.
    ///
    /// Continuation names the token does not use are expired, so a shorter
    /// session replaces a longer one cleanly. Fails with
    /// [`SessionError::Other`] when the token needs more than [`MAX_CHUNKS`]
    /// cookies.
    pub fn session_cookies(&self, token: &str) -> Result<Vec<String>, SessionError> {
        let chunks = chunk(token);
        if chunks.len() > MAX_CHUNKS {
            return Err(SessionError::other(format!(
                "cookie: session of {} bytes exceeds {} chunks",
                token.len(),
                MAX_CHUNKS
            )));
        }

        let max_age = self.options.expire.as_secs();
        let live = chunks.iter().enumerate().map(|(i, value)| {
            let name = chunk_name(&self.options.name, i);
            self.render(&name, value, max_age)
        });
        let expired = (chunks.len()..MAX_CHUNKS).map(|i| {
            let name = chunk_name(&self.options.name, i);
            self.render(&name, "", 0)
        });
        Ok(live.chain(expired).collect())
    }

    fn render(&self, name: &str, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}; Path=/; Max-Age={}", name, value, max_age);
        if !self.options.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.options.domain);
        }
        if self.options.secure {
            cookie.push_str("; Secure");
        }
        if self.options.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie.push_str("; SameSite=Lax");
        cookie
    }
}

fn chunk_name(name: &str, index: usize) -> String {
    if index == 0 {
        name.to_string()
    } else {
        format!("{}_{}", name, index)
    }
}

/// Split on char boundaries; tokens are base64url so every char is one byte
fn chunk(token: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = token;
    while rest.len() > CHUNK_SIZE {
        let mut at = CHUNK_SIZE;
        while !rest.is_char_boundary(at) {
            at -= 1;
        }
        let (head, tail) = rest.split_at(at);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

/// Join `first` with its continuation cookies; only a full chunk has a successor
fn reassemble(cookies: &[(&str, &str)], name: &str, first: &str) -> String {
    let mut token = first.to_string();
    let mut last = first.len();
    for i in 1..MAX_CHUNKS {
        if last != CHUNK_SIZE {
            break;
        }
        let chunk = chunk_name(name, i);
        match cookies.iter().find(|(n, _)| *n == chunk) {
            Some((_, value)) => {
                token.push_str(value);
                last = value.len();
            }
            None => break,
        }
    }
    token
}

/// All `name=value` pairs from every `Cookie` header, in order
fn request_cookies(headers: &Headers) -> Vec<(&str, &str)> {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, values)| values.iter())
        .flat_map(|value| value.split(';'))
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            Some((name.trim(), value.trim().trim_matches('"')))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionClaims;

    fn options() -> CookieOptions {
        CookieOptions {
            name: "_gatehouse".to_string(),
            domain: "example.com".to_string(),
            secure: true,
            http_only: true,
            expire: Duration::from_secs(3600),
        }
    }

    fn store() -> CookieStore {
        let signer =
            Signer::new(b"0123456789abcdef0123456789abcdef", "authenticate.example.com").unwrap();
        CookieStore::new(options(), signer).unwrap()
    }

    fn valid_token(store: &CookieStore) -> String {
        store
            .signer()
            .sign(&SessionClaims::new("user123", Duration::from_secs(600)))
            .unwrap()
    }

    fn cookie_headers(cookie: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert("Cookie".to_string(), vec![cookie.to_string()]);
        headers
    }

    #[test]
    fn test_empty_name_rejected() {
        let signer = Signer::new(b"secret", "authenticate.example.com").unwrap();
        let opts = CookieOptions {
            name: String::new(),
            ..options()
        };
        let err = CookieStore::new(opts, signer).unwrap_err();
        assert!(matches!(err, SessionError::Other(_)));
    }

    #[test]
    fn test_no_cookie_header() {
        assert_eq!(
            store().load_session(&Headers::new()),
            Err(SessionError::NoSessionFound)
        );
    }

    #[test]
    fn test_other_cookies_only() {
        let headers = cookie_headers("theme=dark; lang=en");
        assert_eq!(
            store().load_session(&headers),
            Err(SessionError::NoSessionFound)
        );
    }

    #[test]
    fn test_load_valid_session() {
        let store = store();
        let token = valid_token(&store);
        let headers = cookie_headers(&format!("theme=dark; _gatehouse={}", token));

        assert_eq!(store.load_session(&headers), Ok(token));
    }

    #[test]
    fn test_lowercase_cookie_header_key() {
        let store = store();
        let token = valid_token(&store);
        let mut headers = Headers::new();
        headers.insert("cookie".to_string(), vec![format!("_gatehouse={}", token)]);

        assert_eq!(store.load_session(&headers), Ok(token));
    }

    #[test]
    fn test_garbled_session_is_malformed() {
        let headers = cookie_headers("_gatehouse=garbage");
        assert_eq!(
            store().load_session(&headers),
            Err(SessionError::Malformed)
        );
    }

    #[test]
    fn test_second_cookie_with_same_name_wins() {
        let store = store();
        let token = valid_token(&store);
        let headers = cookie_headers(&format!("_gatehouse=stale; _gatehouse={}", token));

        assert_eq!(store.load_session(&headers), Ok(token));
    }

    #[test]
    fn test_render_uses_cookie_policy() {
        let cookies = store().session_cookies("abc").unwrap();
        assert_eq!(
            cookies[0],
            "_gatehouse=abc; Path=/; Max-Age=3600; Domain=example.com; Secure; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn test_short_session_expires_unused_chunks() {
        let cookies = store().session_cookies("abc").unwrap();
        assert_eq!(cookies.len(), MAX_CHUNKS);
        for (i, cookie) in cookies.iter().enumerate().skip(1) {
            assert_eq!(
                cookie,
                &format!(
                    "_gatehouse_{}=; Path=/; Max-Age=0; Domain=example.com; Secure; HttpOnly; SameSite=Lax",
                    i
                )
            );
        }
    }

    #[test]
    fn test_stale_continuation_ignored_after_short_chunk() {
        let store = store();
        let token = valid_token(&store);
        assert!(token.len() < CHUNK_SIZE);
        let headers = cookie_headers(&format!("_gatehouse={}; _gatehouse_1=leftover", token));

        assert_eq!(store.load_session(&headers), Ok(token));
    }

    #[test]
    fn test_render_host_only_insecure() {
        let signer = Signer::new(b"secret", "authenticate.example.com").unwrap();
        let store = CookieStore::new(
            CookieOptions {
                domain: String::new(),
                secure: false,
                http_only: false,
                ..options()
            },
            signer,
        )
        .unwrap();

        let cookies = store.session_cookies("abc").unwrap();
        assert_eq!(cookies[0], "_gatehouse=abc; Path=/; Max-Age=3600; SameSite=Lax");
        assert_eq!(cookies[1], "_gatehouse_1=; Path=/; Max-Age=0; SameSite=Lax");
    }

    #[test]
    fn test_large_session_is_chunked_and_reassembled() {
        let store = store();
        let padding = "x".repeat(CHUNK_SIZE * 2);
        let mut claims = SessionClaims::new("user123", Duration::from_secs(600));
        claims
            .extra
            .insert("padding".to_string(), serde_json::json!(padding));
        let token = store.signer().sign(&claims).unwrap();

        let set_cookies = store.session_cookies(&token).unwrap();
        let live: Vec<_> = set_cookies
            .iter()
            .filter(|c| !c.contains("Max-Age=0"))
            .collect();
        assert_eq!(live.len(), 3);
        assert!(live[1].starts_with("_gatehouse_1="));
        assert!(live[2].starts_with("_gatehouse_2="));

        let request_cookie = live
            .iter()
            .map(|c| c.split(';').next().unwrap().to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let headers = cookie_headers(&request_cookie);

        assert_eq!(store.load_session(&headers), Ok(token));
    }

    #[test]
    fn test_oversized_session_rejected() {
        let token = "x".repeat(CHUNK_SIZE * MAX_CHUNKS + 1);
        let err = store().session_cookies(&token).unwrap_err();
        assert!(matches!(err, SessionError::Other(_)));
    }

    #[test]
    fn test_chunk_boundaries() {
        assert_eq!(chunk("abc"), vec!["abc"]);
        let exact = "y".repeat(CHUNK_SIZE);
        assert_eq!(chunk(&exact).len(), 1);
        let over = "y".repeat(CHUNK_SIZE + 1);
        assert_eq!(chunk(&over).len(), 2);
    }
}
