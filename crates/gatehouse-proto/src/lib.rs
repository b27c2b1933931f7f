//! Protocol buffer definitions for the Gatehouse native authorize service.
//!
//! The proxy sends [`IsAuthorizedRequest`] once it has parsed an inbound HTTP
//! request and resolved the caller's identity token. The reply carries the
//! policy decision and, when denied, the evaluator's reasons.
//!
//! ```text
//! proxy ──IsAuthorized──► gatehouse ──► policy evaluator
//!       ◄──allow/deny───
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from authorize.proto
pub mod authorize {
    /// Version 1 of the authorize protocol
    pub mod v1 {
        tonic::include_proto!("gatehouse.authorize.v1");
    }
}

pub use authorize::v1::*;
