//! Atelier - Kubernetes operator for ephemeral development environments
//!
//! Atelier provisions per-user development environments as isolated
//! namespaces (network policy, persistent workspace, workload, service)
//! and keeps external DNS records converged with the live location of
//! each environment's service.
//!
//! # Architecture
//!
//! Two long-running modes share this crate:
//! - The **operator** watches `DevEnvironment` resources and converges
//!   each one into its set of cluster objects.
//! - The **dns** controller watches platform-managed services and
//!   converges their load-balancer addresses into Route53 records,
//!   with a periodic sweep that clears records whose backing service
//!   is gone.
//!
//! # Modules
//!
//! - [`crd`] - The `DevEnvironment` custom resource (spec, status, phase)
//! - [`materialize`] - Generation of cluster objects from an environment spec
//! - [`controller`] - Reconciliation logic for `DevEnvironment` resources
//! - [`dns`] - Service watch loop, DNS synchronizer, and stale-record sweeper
//! - [`retry`] - Backoff helper for transient external failures
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod dns;
pub mod error;
pub mod materialize;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Platform Constants
// =============================================================================
// Label keys and well-known values shared by the operator and the DNS
// controller. The DNS controller's watch selector and the labels stamped
// onto materialized services must agree, so they live here.

/// Label identifying objects owned by this platform
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on every object we create
pub const MANAGED_BY: &str = "atelier";

/// Label selector matching all platform-managed objects
pub const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by=atelier";

/// Label carrying the full environment identifier
pub const LABEL_ENVIRONMENT_ID: &str = "atelier.dev/environment-id";

/// Label carrying the owning team
pub const LABEL_TEAM: &str = "atelier.dev/team";

/// Label carrying the owning project
pub const LABEL_PROJECT: &str = "atelier.dev/project";

/// Finalizer gating namespace cleanup on environment deletion
pub const ENVIRONMENT_FINALIZER: &str = "atelier.dev/cleanup";

/// SSH port exposed when shell access is enabled
pub const PORT_SSH: i32 = 22;

/// Jupyter port exposed when notebook access is enabled
pub const PORT_JUPYTER: i32 = 8888;

/// VS Code server port exposed when editor access is enabled
pub const PORT_VSCODE: i32 = 8080;

/// Hostname suffix marking an AWS-assigned load balancer alias target
pub const ELB_ALIAS_SUFFIX: &str = ".elb.amazonaws.com";
