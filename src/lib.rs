//! Loglet - log-forwarding sidecar injection for Kubernetes pods
//!
//! Loglet has two halves that ship in one binary:
//!
//! - an admission webhook that, for every pod created in a watched
//!   namespace, provisions a pod-scoped Role and RoleBinding and patches in
//!   a log-forwarding sidecar
//! - the relay that runs inside that sidecar, following the application
//!   container's log stream and forwarding each chunk to a log ingestion
//!   service over mTLS
//!
//! Identity flows from the webhook to the relay only through the sidecar's
//! environment (see [`sidecar::env`]).
//!
//! # Modules
//!
//! - [`rbac`] - Pod-scoped credential provisioning
//! - [`service_account`] - Service-account token volume resolution
//! - [`sidecar`] - Sidecar container and pod composition
//! - [`mutation`] - Pod mutation contract and admission handling
//! - [`webhook`] - HTTPS admission webhook and its registration
//! - [`controller`] - Owner-reference controller for injected pods
//! - [`relay`] - Log stream relay and ingestion client
//! - [`config`] - Process configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod mutation;
pub mod rbac;
pub mod relay;
pub mod service_account;
pub mod sidecar;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
