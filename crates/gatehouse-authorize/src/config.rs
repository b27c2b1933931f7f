//! Service configuration and the shared configuration snapshot
//!
//! Every call reads configuration through [`SharedSnapshot::load`], which
//! hands out an `Arc` to an immutable [`Snapshot`]. Updates build a complete
//! new snapshot and swap the pointer, so a reader sees either the old or the
//! new configuration, never a mix.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::request::Headers;
use crate::session::{CookieOptions, CookieStore, SessionError, Signer};

/// Default session cookie name
pub const DEFAULT_COOKIE_NAME: &str = "_gatehouse";

/// Default session cookie lifetime (14 hours)
pub const DEFAULT_COOKIE_EXPIRE_SECS: u64 = 14 * 60 * 60;

/// Default sign-in endpoint, served on every proxied host
pub const DEFAULT_SIGN_IN_PATH: &str = "/.gatehouse/sign_in";

/// Default query parameter carrying the post-login destination
pub const DEFAULT_REDIRECT_QUERY_PARAM: &str = "gatehouse_redirect_uri";

/// Default deadline for a single policy evaluation
pub const DEFAULT_EVALUATION_TIMEOUT_MS: u64 = 2000;

/// Authorize service options
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Secret shared with the authenticate service for session signing
    pub shared_secret: String,
    /// URL of the authenticate service; its host is the session audience
    pub authenticate_url: String,
    /// Session cookie name
    pub cookie_name: String,
    /// Session cookie domain
    pub cookie_domain: String,
    /// Mark the session cookie `Secure`
    pub cookie_secure: bool,
    /// Mark the session cookie `HttpOnly`
    pub cookie_http_only: bool,
    /// Session cookie lifetime in seconds
    pub cookie_expire_secs: u64,
    /// Path of the sign-in endpoint
    pub sign_in_path: String,
    /// Query parameter carrying the original URL on sign-in redirects
    pub redirect_query_param: String,
    /// Deadline for one policy evaluation, in milliseconds
    pub evaluation_timeout_ms: u64,
    /// Cedar policy file for the built-in evaluator
    pub policy_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            authenticate_url: String::new(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_domain: String::new(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_expire_secs: DEFAULT_COOKIE_EXPIRE_SECS,
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            redirect_query_param: DEFAULT_REDIRECT_QUERY_PARAM.to_string(),
            evaluation_timeout_ms: DEFAULT_EVALUATION_TIMEOUT_MS,
            policy_file: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("shared_secret", &"<redacted>")
            .field("authenticate_url", &self.authenticate_url)
            .field("cookie_name", &self.cookie_name)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_http_only", &self.cookie_http_only)
            .field("cookie_expire_secs", &self.cookie_expire_secs)
            .field("sign_in_path", &self.sign_in_path)
            .field("redirect_query_param", &self.redirect_query_param)
            .field("evaluation_timeout_ms", &self.evaluation_timeout_ms)
            .field("policy_file", &self.policy_file)
            .finish()
    }
}

impl Options {
    /// Parse options from YAML; absent fields take their defaults
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid options: {}", e)))
    }

    /// Read options from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Reject options the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.is_empty() {
            return Err(Error::configuration("shared_secret is required"));
        }
        if self.authenticate_host().is_empty() {
            return Err(Error::configuration(format!(
                "authenticate_url must be an absolute URL with a host, got '{}'",
                self.authenticate_url
            )));
        }
        if self.cookie_name.is_empty() {
            return Err(Error::configuration("cookie_name is required"));
        }
        if !self.sign_in_path.starts_with('/') {
            return Err(Error::configuration(format!(
                "sign_in_path must start with '/', got '{}'",
                self.sign_in_path
            )));
        }
        if self.redirect_query_param.is_empty() {
            return Err(Error::configuration("redirect_query_param is required"));
        }
        if self.evaluation_timeout_ms == 0 {
            return Err(Error::configuration("evaluation_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// `host[:port]` of the authenticate URL, empty when it does not parse
    pub fn authenticate_host(&self) -> String {
        let Ok(url) = Url::parse(&self.authenticate_url) else {
            return String::new();
        };
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        }
    }

    /// Session cookie policy
    pub fn cookie_options(&self) -> CookieOptions {
        CookieOptions {
            name: self.cookie_name.clone(),
            domain: self.cookie_domain.clone(),
            secure: self.cookie_secure,
            http_only: self.cookie_http_only,
            expire: Duration::from_secs(self.cookie_expire_secs),
        }
    }

    /// Policy evaluation deadline
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }
}

/// Immutable configuration shared by every call
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    options: Options,
    /// Built once per snapshot; a construction failure is replayed per call
    session_store: std::result::Result<CookieStore, SessionError>,
}

impl Snapshot {
    /// Build a snapshot, constructing the session verifier up front
    pub fn new(options: Options) -> Self {
        Self::with_generation(options, 0)
    }

    fn with_generation(options: Options, generation: u64) -> Self {
        let session_store = Signer::new(
            options.shared_secret.as_bytes(),
            options.authenticate_host(),
        )
        .and_then(|signer| CookieStore::new(options.cookie_options(), signer));

        if let Err(e) = &session_store {
            warn!(error = %e, "Session verifier unavailable; all sessions will be rejected");
        }

        Self {
            generation,
            options,
            session_store,
        }
    }

    /// Monotonic snapshot number, starting at zero
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Options this snapshot was built from
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Session store, or the error that prevented building it
    pub fn session_store(&self) -> std::result::Result<&CookieStore, SessionError> {
        self.session_store.as_ref().map_err(Clone::clone)
    }

    /// Resolve and verify the session carried in `headers`
    pub fn load_session(&self, headers: &Headers) -> std::result::Result<String, SessionError> {
        self.session_store()?.load_session(headers)
    }
}

/// Atomically published [`Snapshot`]
///
/// Readers clone the `Arc` and drop the guard before doing any work.
/// Publishers number and swap under the write lock, so generations become
/// visible in increasing order.
#[derive(Debug, Clone)]
pub struct SharedSnapshot {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl SharedSnapshot {
    /// Publish the initial snapshot
    pub fn new(options: Options) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(Snapshot::new(options)))),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Build and publish a new snapshot from `options`
    pub fn publish(&self, options: Options) -> Arc<Snapshot> {
        let mut current = self.current.write();
        let generation = current.generation() + 1;
        let snapshot = Arc::new(Snapshot::with_generation(options, generation));
        *current = snapshot.clone();
        drop(current);

        info!(generation = generation, "Published configuration snapshot");
        snapshot
    }
}
