//! Controllers for injected pods
//!
//! The admission path creates a Role and RoleBinding for every injected pod
//! before the pod exists, so they cannot carry an owner reference yet. The
//! owner controller attaches one once the pod is live, letting cluster
//! garbage collection remove both objects with the pod.

mod owner;

pub use owner::{error_policy, owner_reference, reconcile, Context};
