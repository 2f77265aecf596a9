//! Admission probing
//!
//! A probe submits one object (or one subresource patch) to the API server
//! and classifies the response. The classification has three arms, and only
//! a real admission decision may ever be counted as a denial:
//!
//! - [`AdmissionOutcome::Admitted`] - the server persisted the object
//! - [`AdmissionOutcome::Denied`] - an admission policy or webhook refused it
//! - [`AdmissionOutcome::InfrastructureError`] - anything else (conflicts,
//!   unknown kinds, RBAC, schema validation, transport)

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DynamicObject, Patch, PatchParams, PostParams};
use serde_json::{json, Value};
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::kube_utils::{manifest_metadata, ApiResolver};
use crate::{Error, FIELD_MANAGER};

const POLICY_DENIAL_PREFIX: &str = "ValidatingAdmissionPolicy '";
const POLICY_DENIAL_BINDING: &str = "' with binding '";
const POLICY_DENIAL_SUFFIX: &str = "' denied request: ";
const WEBHOOK_DENIAL_PREFIX: &str = "admission webhook \"";
const WEBHOOK_DENIAL_SUFFIX: &str = "\" denied the request";

// =============================================================================
// Outcomes
// =============================================================================

/// Who refused a submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenialSource {
    /// A ValidatingAdmissionPolicy through one of its bindings
    Policy {
        /// Policy object name
        policy: String,
        /// Binding object name
        binding: String,
    },
    /// A validating or mutating admission webhook
    Webhook {
        /// Webhook name
        name: String,
    },
}

/// An admission denial
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denial {
    /// Who denied
    pub source: DenialSource,
    /// Full server message
    pub message: String,
    /// HTTP status code of the response
    pub code: u16,
}

impl Denial {
    /// Policy name, when a ValidatingAdmissionPolicy denied
    pub fn policy(&self) -> Option<&str> {
        match &self.source {
            DenialSource::Policy { policy, .. } => Some(policy),
            DenialSource::Webhook { .. } => None,
        }
    }
}

/// Coarse class of a non-admission failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfraErrorKind {
    /// Object already exists (409)
    Conflict,
    /// Target or kind does not exist (404, unknown kind)
    NotFound,
    /// RBAC refused the request (403 without an admission decision)
    Forbidden,
    /// Schema validation or malformed manifest (400, 422)
    InvalidObject,
    /// Response body could not be decoded
    Decode,
    /// Connection-level failure
    Transport,
    /// Everything else
    Other,
}

/// A failure that is not an admission decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfraError {
    /// Classification
    pub kind: InfraErrorKind,
    /// Human-readable cause
    pub message: String,
}

/// Result of one probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The object was persisted
    Admitted,
    /// Admission refused the object
    Denied(Denial),
    /// The request failed for a reason unrelated to admission
    InfrastructureError(InfraError),
}

impl AdmissionOutcome {
    /// Whether the object was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted)
    }

    /// The denial, if admission refused the object
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            AdmissionOutcome::Denied(d) => Some(d),
            _ => None,
        }
    }

    fn infra(kind: InfraErrorKind, message: impl Into<String>) -> Self {
        AdmissionOutcome::InfrastructureError(InfraError {
            kind,
            message: message.into(),
        })
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionOutcome::Admitted => write!(f, "admitted"),
            AdmissionOutcome::Denied(d) => write!(f, "denied ({}): {}", d.code, d.message),
            AdmissionOutcome::InfrastructureError(e) => {
                write!(f, "infrastructure error ({:?}): {}", e.kind, e.message)
            }
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Extract `(policy, binding)` from a ValidatingAdmissionPolicy denial message.
///
/// The message may be wrapped by the API server (`pods "x" is forbidden: ...`).
///
/// ```
/// use vap_library::probe::parse_policy_denial;
///
/// let msg = "pods \"p\" is forbidden: ValidatingAdmissionPolicy 'pss-capabilities.vap-library.com' \
///            with binding 'pss-capabilities-binding' denied request: drop ALL";
/// assert_eq!(
///     parse_policy_denial(msg),
///     Some(("pss-capabilities.vap-library.com".to_string(), "pss-capabilities-binding".to_string()))
/// );
/// assert_eq!(parse_policy_denial("namespaces \"x\" not found"), None);
/// ```
pub fn parse_policy_denial(message: &str) -> Option<(String, String)> {
    let (_, rest) = message.split_once(POLICY_DENIAL_PREFIX)?;
    let (policy, rest) = rest.split_once(POLICY_DENIAL_BINDING)?;
    let (binding, _) = rest.split_once(POLICY_DENIAL_SUFFIX)?;
    Some((policy.to_string(), binding.to_string()))
}

fn parse_webhook_denial(message: &str) -> Option<String> {
    let (_, rest) = message.split_once(WEBHOOK_DENIAL_PREFIX)?;
    let (name, _) = rest.split_once(WEBHOOK_DENIAL_SUFFIX)?;
    Some(name.to_string())
}

/// Classify a failed API call
pub fn classify_error(err: &kube::Error) -> AdmissionOutcome {
    match err {
        kube::Error::Api(resp) => {
            let source = parse_policy_denial(&resp.message)
                .map(|(policy, binding)| DenialSource::Policy { policy, binding })
                .or_else(|| {
                    parse_webhook_denial(&resp.message).map(|name| DenialSource::Webhook { name })
                });
            if let Some(source) = source {
                return AdmissionOutcome::Denied(Denial {
                    source,
                    message: resp.message.clone(),
                    code: resp.code,
                });
            }
            let kind = match resp.code {
                409 => InfraErrorKind::Conflict,
                404 => InfraErrorKind::NotFound,
                403 => InfraErrorKind::Forbidden,
                400 | 422 => InfraErrorKind::InvalidObject,
                _ => InfraErrorKind::Other,
            };
            AdmissionOutcome::infra(kind, format!("{} ({}): {}", resp.reason, resp.code, resp.message))
        }
        kube::Error::SerdeError(e) => AdmissionOutcome::infra(InfraErrorKind::Decode, e.to_string()),
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            AdmissionOutcome::infra(InfraErrorKind::Transport, err.to_string())
        }
        other => AdmissionOutcome::infra(InfraErrorKind::Other, other.to_string()),
    }
}

fn classify_harness_error(err: &Error) -> AdmissionOutcome {
    match err {
        Error::Kube { source } => classify_error(source),
        Error::Manifest { message } if message.starts_with("unknown resource type") => {
            AdmissionOutcome::infra(InfraErrorKind::NotFound, message.clone())
        }
        Error::Manifest { message } => {
            AdmissionOutcome::infra(InfraErrorKind::InvalidObject, message.clone())
        }
        other => AdmissionOutcome::infra(InfraErrorKind::Other, other.to_string()),
    }
}

// =============================================================================
// Submission
// =============================================================================

/// Identifies an existing object, e.g. the pod an ephemeral container is
/// attached to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTarget {
    /// `group/version` or `version`
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Object name
    pub name: String,
}

impl ObjectTarget {
    /// Target with the given coordinates
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Core v1 Pod named `name`
    pub fn pod(name: impl Into<String>) -> Self {
        Self::new("v1", "Pod", name)
    }

    /// Target addressing the object described by `manifest`
    pub fn of(manifest: &Value) -> Result<Self, Error> {
        let meta = manifest_metadata(manifest.clone())?;
        let api_version = manifest["apiVersion"].as_str().unwrap_or_default().to_string();
        Ok(Self {
            api_version,
            kind: meta.gvk.kind,
            name: meta.name,
        })
    }

    fn stub(&self) -> Value {
        json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "metadata": { "name": self.name },
        })
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Submits objects into a namespace on behalf of scenarios
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceSubmitter: Send + Sync {
    /// Create `manifest` and classify the response
    async fn create(&self, namespace: &str, manifest: &Value) -> AdmissionOutcome;

    /// Strategic-merge `patch` into `subresource` of `target`
    async fn patch_subresource(
        &self,
        namespace: &str,
        target: &ObjectTarget,
        subresource: &str,
        patch: &Value,
    ) -> AdmissionOutcome;

    /// Server-side apply `manifest`; failures are errors, not outcomes
    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), Error>;

    /// Whether `target` can currently be read
    async fn exists(&self, namespace: &str, target: &ObjectTarget) -> Result<bool, Error>;
}

/// [`ResourceSubmitter`] backed by a live API server
pub struct AdmissionProbe {
    resolver: Arc<ApiResolver>,
}

impl AdmissionProbe {
    /// Probe resolving kinds through `resolver`
    pub fn new(resolver: Arc<ApiResolver>) -> Self {
        Self { resolver }
    }

    /// Create an object given as YAML
    pub async fn create_yaml(&self, namespace: &str, yaml: &str) -> AdmissionOutcome {
        match crate::yaml::parse_yaml(yaml) {
            Ok(Value::Null) => AdmissionOutcome::infra(InfraErrorKind::InvalidObject, "empty manifest"),
            Ok(manifest) => self.create(namespace, &manifest).await,
            Err(e) => AdmissionOutcome::infra(InfraErrorKind::InvalidObject, e.to_string()),
        }
    }

    async fn try_create(&self, namespace: &str, manifest: &Value) -> Result<(), Error> {
        let meta = manifest_metadata(manifest.clone())?;
        let resolved = self.resolver.resolve(&meta.gvk).await?;

        let mut value = meta.value;
        if resolved.namespaced {
            value["metadata"]["namespace"] = json!(namespace);
        }
        let object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::manifest(format!("{}: {}", meta.gvk.kind, e)))?;

        let api = self.resolver.api_for(&resolved, Some(namespace));
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, &object).await?;
        Ok(())
    }

    async fn try_patch_subresource(
        &self,
        namespace: &str,
        target: &ObjectTarget,
        subresource: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        let meta = manifest_metadata(target.stub())?;
        let resolved = self.resolver.resolve(&meta.gvk).await?;
        let api = self.resolver.api_for(&resolved, Some(namespace));
        api.patch_subresource(
            subresource,
            &target.name,
            &PatchParams::default(),
            &Patch::Strategic(patch),
        )
        .await?;
        Ok(())
    }
}

fn outcome_of(result: Result<(), Error>) -> AdmissionOutcome {
    match result {
        Ok(()) => AdmissionOutcome::Admitted,
        Err(e) => classify_harness_error(&e),
    }
}

#[async_trait]
impl ResourceSubmitter for AdmissionProbe {
    async fn create(&self, namespace: &str, manifest: &Value) -> AdmissionOutcome {
        let outcome = outcome_of(self.try_create(namespace, manifest).await);
        debug!(namespace = %namespace, kind = ?manifest.get("kind"), outcome = %outcome, "probe create");
        outcome
    }

    async fn patch_subresource(
        &self,
        namespace: &str,
        target: &ObjectTarget,
        subresource: &str,
        patch: &Value,
    ) -> AdmissionOutcome {
        let outcome = outcome_of(
            self.try_patch_subresource(namespace, target, subresource, patch)
                .await,
        );
        debug!(namespace = %namespace, target = %target, subresource = %subresource, outcome = %outcome, "probe patch");
        outcome
    }

    async fn apply(&self, namespace: &str, manifest: &Value) -> Result<(), Error> {
        let meta = manifest_metadata(manifest.clone())?;
        let resolved = self.resolver.resolve(&meta.gvk).await?;
        let mut value = meta.value;
        if resolved.namespaced {
            value["metadata"]["namespace"] = json!(namespace);
        }
        self.resolver.apply(&value).await?;
        Ok(())
    }

    async fn exists(&self, namespace: &str, target: &ObjectTarget) -> Result<bool, Error> {
        let meta = manifest_metadata(target.stub())?;
        let resolved = self.resolver.resolve(&meta.gvk).await?;
        let api = self.resolver.api_for(&resolved, Some(namespace));
        let found = api.get_opt(&target.name).await?.is_some();
        trace!(target = %target, namespace = %namespace, found, "existence check");
        Ok(found)
    }
}
