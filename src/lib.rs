//! vap-library - ValidatingAdmissionPolicy bundles and their conformance harness
//!
//! The policies themselves live under `policies/<name>/` as plain YAML and are
//! enforced by the Kubernetes API server. This crate is the machinery that
//! proves they behave: it provisions a cluster, installs a policy bundle,
//! submits candidate workloads into isolated namespaces and checks that every
//! submission is admitted or denied as expected.
//!
//! # Modules
//!
//! - [`env`] - Test environment: cluster lifecycle, policy installation, teardown
//! - [`provider`] - Cluster providers (kind) behind a mockable trait
//! - [`policy`] - Policy bundle loading and binding generation
//! - [`namespace`] - Per-test namespace isolation and the namespace registry
//! - [`manifest`] - Workload and ephemeral-container manifest builders
//! - [`template`] - `${...}` templating for free-form manifests
//! - [`probe`] - Admission probe and outcome classification
//! - [`scenario`] - Declarative features, scenarios and the run report
//! - [`config`] - Environment configuration
//! - [`kube_utils`] - kube-rs helpers (clients, manifests, polling)
//! - [`retry`] - Retry with exponential backoff
//! - [`yaml`] - YAML decoding into JSON values
//! - [`telemetry`] - Logging setup for suite binaries
//! - [`error`] - Error types for the harness

#![deny(missing_docs)]

pub mod config;
pub mod env;
pub mod error;
pub mod kube_utils;
pub mod manifest;
pub mod namespace;
pub mod policy;
pub mod probe;
pub mod provider;
pub mod retry;
pub mod scenario;
pub mod telemetry;
pub mod template;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================

/// Domain every policy, binding parameter and namespace label lives under
pub const POLICY_DOMAIN: &str = "vap-library.com";

/// Label value that opts a namespace into a policy's enforcement
pub const ENFORCE_LABEL_VALUE: &str = "deny";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Managed-by value stamped on everything the harness creates
pub const LABEL_MANAGED_BY_HARNESS: &str = "vap-library";

/// Field manager used for server-side apply of setup resources
pub const FIELD_MANAGER: &str = "vap-library";

/// Prefix for kind clusters created by the harness
pub const CLUSTER_NAME_PREFIX: &str = "vap-library-";

/// Image used by generated test containers
///
/// Pods are never expected to run, only to pass admission, but a small pullable
/// image keeps accidental scheduling cheap.
pub const DEFAULT_TEST_IMAGE: &str = "public.ecr.aws/docker/library/busybox:1.36";

/// Namespace label key that opts a namespace into `policy`'s bindings.
///
/// ```
/// assert_eq!(
///     vap_library::enforcement_label_key("pss-capabilities"),
///     "vap-library.com/pss-capabilities"
/// );
/// ```
pub fn enforcement_label_key(policy: &str) -> String {
    format!("{}/{}", POLICY_DOMAIN, policy)
}

/// Cluster object name of a policy (and of its parameter resource).
///
/// ```
/// assert_eq!(
///     vap_library::policy_object_name("service-type"),
///     "service-type.vap-library.com"
/// );
/// ```
pub fn policy_object_name(policy: &str) -> String {
    format!("{}.{}", policy, POLICY_DOMAIN)
}
