//! Gardener discovery server - public OIDC metadata and trust material
//!
//! The discovery server republishes per-shoot OpenID discovery documents,
//! JWKS and cluster CA bundles on behalf of the garden cluster, plus the
//! garden's own workload identity documents. Sources are label-selected
//! resources in the garden cluster, validated and projected into in-memory
//! stores by reconcilers and served read-only over HTTPS.
//!
//! # Modules
//!
//! - [`store`] - concurrency safe in-memory stores for the served documents
//! - [`garden`] - garden cluster resource types, label contract and access
//! - [`reconciler`] - validating projections from watch events into the stores
//! - [`handler`] - HTTP routes, middleware and response envelopes
//! - [`dynamiccert`] - hot-swapping TLS certificate provider
//! - [`metrics`] - per-path request metrics
//! - [`server`] - composition and lifecycle of all of the above
//! - [`error`] - error types for the server

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod dynamiccert;
pub mod error;
pub mod garden;
pub mod handler;
pub mod metrics;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testdata;

pub use error::Error;

/// Result type alias using the server's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
