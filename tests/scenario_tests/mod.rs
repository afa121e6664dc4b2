//! Scenario tests
//!
//! - `injection`: stories about admitting pods through the webhook path,
//!   from the AdmissionRequest to the patched pod and the RBAC objects left
//!   in the cluster
//!
//! - `relay`: stories about the sidecar following a container and what the
//!   ingestion service receives

mod fakes;
mod injection;
mod relay;
