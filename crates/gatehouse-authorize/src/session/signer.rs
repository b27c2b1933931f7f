//! HS256 session token signing and verification
//!
//! The signer is bound to a shared secret and to the audience of the
//! authenticate service, so a token minted for one authenticate host is
//! rejected by a proxy configured for another.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey};
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::SessionError;

/// Clock skew tolerance applied to `exp`, `nbf` and `iat`
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

/// Session token claims
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Group memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Audience (can be string or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Expiration time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    /// Not before time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    /// Issued at time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,

    /// Remaining claims
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SessionClaims {
    /// Claims for `subject` valid from now for `lifetime`
    pub fn new(subject: impl Into<String>, lifetime: Duration) -> Self {
        let now = get_current_timestamp();
        Self {
            sub: Some(subject.into()),
            iat: Some(now),
            nbf: Some(now),
            exp: Some(now + lifetime.as_secs()),
            ..Default::default()
        }
    }

    /// Set the email claim
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the groups claim
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Audience claim (can be string or array)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience
    Single(String),
    /// Multiple audiences
    Multiple(Vec<String>),
}

/// Symmetric signer/verifier for session tokens
#[derive(Clone)]
pub struct Signer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    audience: String,
    leeway: u64,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("audience", &self.audience)
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Create a signer bound to `secret` and `audience`
    ///
    /// Fails with [`SessionError::Other`] when either is empty.
    pub fn new(secret: &[u8], audience: impl Into<String>) -> Result<Self, SessionError> {
        let audience = audience.into();
        if secret.is_empty() {
            return Err(SessionError::other("signer: shared secret is required"));
        }
        if audience.is_empty() {
            return Err(SessionError::other("signer: audience is required"));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            audience,
            leeway: DEFAULT_LEEWAY_SECS,
        })
    }

    /// Override the clock skew tolerance
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway.as_secs();
        self
    }

    /// Audience this signer issues for and accepts
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Sign claims, filling in the bound audience when unset
    pub fn sign(&self, claims: &SessionClaims) -> Result<String, SessionError> {
        let mut claims = claims.clone();
        if claims.aud.is_none() {
            claims.aud = Some(Audience::Single(self.audience.clone()));
        }

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SessionError::other(format!("signer: {}", e)))
    }

    /// Verify a token and return its claims
    ///
    /// Checks the signature, `aud`, `exp`, `nbf` and `iat`.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;

        let claims = decode::<SessionClaims>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "Session token rejected");
                session_error_from_jwt(e.kind())
            })?
            .claims;

        if let Some(iat) = claims.iat {
            let now = get_current_timestamp();
            if iat > now + self.leeway {
                debug!(iat = iat, now = now, "Session token issued in the future");
                return Err(SessionError::IssuedInFuture);
            }
        }

        Ok(claims)
    }
}

fn session_error_from_jwt(kind: &ErrorKind) -> SessionError {
    match kind {
        ErrorKind::ExpiredSignature => SessionError::Expired,
        ErrorKind::ImmatureSignature => SessionError::NotValidYet,
        ErrorKind::InvalidToken
        | ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => SessionError::Malformed,
        ErrorKind::InvalidAudience => SessionError::other("session: invalid audience (aud)"),
        other => SessionError::other(format!("session: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn signer() -> Signer {
        Signer::new(SECRET, "authenticate.example.com").unwrap()
    }

    fn claims_at(iat: u64, nbf: u64, exp: u64) -> SessionClaims {
        SessionClaims {
            sub: Some("user123".to_string()),
            iat: Some(iat),
            nbf: Some(nbf),
            exp: Some(exp),
            ..Default::default()
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = signer();
        let claims = SessionClaims::new("user123", Duration::from_secs(3600))
            .with_email("alice@example.com")
            .with_groups(vec!["admins".to_string()]);

        let token = signer.sign(&claims).unwrap();
        let verified = signer.verify(&token).unwrap();

        assert_eq!(verified.sub.as_deref(), Some("user123"));
        assert_eq!(verified.email.as_deref(), Some("alice@example.com"));
        assert_eq!(verified.groups, vec!["admins"]);
        assert_eq!(
            verified.aud,
            Some(Audience::Single("authenticate.example.com".to_string()))
        );
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err = Signer::new(b"", "authenticate.example.com").unwrap_err();
        assert!(matches!(err, SessionError::Other(_)));
    }

    #[test]
    fn test_empty_audience_rejected() {
        let err = Signer::new(SECRET, "").unwrap_err();
        assert!(matches!(err, SessionError::Other(_)));
    }

    #[test]
    fn test_expired_token() {
        let now = get_current_timestamp();
        let token = signer()
            .sign(&claims_at(now - 7200, now - 7200, now - 3600))
            .unwrap();
        assert_eq!(signer().verify(&token), Err(SessionError::Expired));
    }

    #[test]
    fn test_not_valid_yet() {
        let now = get_current_timestamp();
        let token = signer()
            .sign(&claims_at(now, now + 3600, now + 7200))
            .unwrap();
        assert_eq!(signer().verify(&token), Err(SessionError::NotValidYet));
    }

    #[test]
    fn test_issued_in_future() {
        let now = get_current_timestamp();
        let token = signer()
            .sign(&claims_at(now + 3600, now, now + 7200))
            .unwrap();
        assert_eq!(signer().verify(&token), Err(SessionError::IssuedInFuture));
    }

    #[test]
    fn test_leeway_absorbs_small_skew() {
        let now = get_current_timestamp();
        let token = signer().sign(&claims_at(now + 30, now + 30, now + 3600)).unwrap();
        assert!(signer().verify(&token).is_ok());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(signer().verify("not-a-jwt"), Err(SessionError::Malformed));
    }

    #[test]
    fn test_wrong_secret_is_malformed() {
        let other = Signer::new(b"another-secret-another-secret-xx", "authenticate.example.com")
            .unwrap();
        let token = other
            .sign(&SessionClaims::new("user123", Duration::from_secs(60)))
            .unwrap();
        assert_eq!(signer().verify(&token), Err(SessionError::Malformed));
    }

    #[test]
    fn test_foreign_audience_is_unrecoverable() {
        let foreign = Signer::new(SECRET, "authenticate.other.com").unwrap();
        let token = foreign
            .sign(&SessionClaims::new("user123", Duration::from_secs(60)))
            .unwrap();

        let err = signer().verify(&token).unwrap_err();
        assert!(matches!(err, SessionError::Other(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_audience_array_is_accepted() {
        let signer = signer();
        let mut claims = SessionClaims::new("user123", Duration::from_secs(600));
        claims.aud = Some(Audience::Multiple(vec![
            "api.example.com".to_string(),
            "authenticate.example.com".to_string(),
        ]));

        let token = signer.sign(&claims).unwrap();
        let verified = signer.verify(&token).unwrap();
        assert!(matches!(verified.aud, Some(Audience::Multiple(ref v)) if v.len() == 2));
    }

    #[test]
    fn test_debug_omits_key_material() {
        let rendered = format!("{:?}", signer());
        assert!(rendered.contains("authenticate.example.com"));
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
