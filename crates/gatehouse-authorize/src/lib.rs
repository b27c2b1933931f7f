//! Authorization decision core for the Gatehouse access proxy
//!
//! Decides whether a proxied request may proceed and, when it may not,
//! whether the caller should be sent through sign-in or rejected outright.
//!
//! # Request Flow
//!
//! ```text
//! IsAuthorized / Check
//!        │
//!        ▼
//! CanonicalRequest ──► session (Check only) ──► PolicyEvaluator
//!                                                     │
//!                         Outcome::decide ◄───────────┘
//!                               │
//!            Allowed | DeniedForbidden | DeniedUnauthenticatedRedirect
//! ```

#![deny(missing_docs)]

pub mod cedar;
pub mod config;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod request;
pub mod server;
pub mod session;
pub mod urlutil;

pub use cedar::CedarEvaluator;
pub use config::{Options, SharedSnapshot, Snapshot};
pub use decision::Outcome;
pub use error::{Error, Result};
pub use evaluator::{evaluate, Decision, PolicyEvaluator};
pub use request::{CanonicalRequest, Headers};
pub use server::{AuthorizeServer, AuthorizeService};
pub use session::{classify, SessionClaims, SessionError, SessionStatus, Signer};
