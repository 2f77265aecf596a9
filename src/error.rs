//! Error types for the conformance harness
//!
//! Errors carry enough context (cluster, resource, namespace) to explain a
//! failed run from the log alone. Admission outcomes are deliberately NOT
//! errors: a denied submission is a normal [`crate::probe::AdmissionOutcome`].

use std::time::Duration;

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error during setup or teardown
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cluster could not be created, reached or torn down
    #[error("provision error for cluster {cluster}: {message}")]
    Provision {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A policy, binding, CRD or extra resource failed to install
    #[error("install error for {resource}: {message}")]
    Install {
        /// Resource being installed (e.g. "ValidatingAdmissionPolicy/foo")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait expired before the resource was observed ready
    #[error("{resource} not ready after {waited:?}")]
    NotReady {
        /// What was being waited for
        resource: String,
        /// How long the harness waited
        waited: Duration,
    },

    /// Manifest parsing, templating or materialisation error
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of what failed
        message: String,
    },

    /// Namespace creation or cleanup error
    #[error("namespace error for {namespace}: {message}")]
    Namespace {
        /// Namespace being created or deleted
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid harness configuration
    #[error("config error: {message}")]
    Config {
        /// Description of what is invalid
        message: String,
    },

    /// I/O error (policy files, kubeconfig, process spawning)
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a provision error for a cluster
    pub fn provision(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an install error for a resource
    pub fn install(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Install {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-ready error after waiting `waited`
    pub fn not_ready(resource: impl Into<String>, waited: Duration) -> Self {
        Self::NotReady {
            resource: resource.into(),
            waited,
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
        }
    }

    /// Create a namespace error
    pub fn namespace(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Namespace {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error is an eventual-consistency timeout rather than a
    /// hard failure.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a policy that never becomes observed surfaces as a timeout,
    /// not as a generic install failure
    #[test]
    fn story_registration_timeout_is_its_own_kind() {
        let err = Error::not_ready(
            "ValidatingAdmissionPolicy/pss-capabilities.vap-library.com",
            Duration::from_secs(120),
        );
        assert!(err.is_not_ready());
        assert!(err.to_string().contains("not ready after 120s"));
        assert!(err.to_string().contains("pss-capabilities"));

        let err = Error::install("ValidatingAdmissionPolicy/x", "CEL compile error");
        assert!(!err.is_not_ready());
    }

    /// Story: provisioning failures name the cluster they happened to
    #[test]
    fn story_provision_errors_name_the_cluster() {
        let err = Error::provision("vap-library-abc123", "kind create cluster exited 1");
        assert_eq!(
            err.to_string(),
            "provision error for cluster vap-library-abc123: kind create cluster exited 1"
        );
    }

    #[test]
    fn constructors_accept_str_and_string() {
        let ns = format!("pss-{}", "abc");
        let err = Error::namespace(ns, "already exists");
        assert!(err.to_string().contains("pss-abc"));

        let err = Error::manifest("missing kind");
        match err {
            Error::Manifest { message } => assert_eq!(message, "missing kind"),
            other => panic!("expected Manifest, got {other:?}"),
        }

        let err = Error::config(String::from("VAP_READY_TIMEOUT_SECS must be a number"));
        assert!(err.to_string().starts_with("config error"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read() -> Result<(), Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "policy.yaml"))?;
            Ok(())
        }
        let err = read().unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.to_string().contains("policy.yaml"));
    }
}
