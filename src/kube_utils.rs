//! Kubernetes utilities using kube-rs
//!
//! Client construction, manifest parsing, API resolution and bounded polling
//! shared by the provisioner, the namespace isolator and the admission probe.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, Config};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "Established" condition type for CRDs
pub const CONDITION_ESTABLISHED: &str = "Established";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients (5s is plenty for a local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Conditions
// =============================================================================

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Types with condition-like fields (type and status)
pub trait HasConditionFields {
    /// Condition type
    fn type_field(&self) -> &str;
    /// Condition status
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields
    for k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinitionCondition
{
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` expires.
///
/// Errors from the check are treated as "not yet" (the resource may simply
/// not exist yet) and logged at trace level. On timeout returns
/// [`Error::NotReady`] naming `resource`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    resource: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = Instant::now();
    let resource = resource.into();

    loop {
        match check_fn().await {
            Ok(true) => {
                debug!(resource = %resource, elapsed_ms = start.elapsed().as_millis() as u64, "ready");
                return Ok(());
            }
            Ok(false) => trace!(resource = %resource, "not ready yet"),
            Err(e) => trace!(resource = %resource, error = %e, "readiness check failed, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::not_ready(resource, timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

// =============================================================================
// Clients
// =============================================================================

/// Create a kube client from an optional kubeconfig path with default timeouts.
///
/// Retries briefly: a kind API server that just reported success can still
/// refuse the first connections.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let retry = RetryConfig::with_max_attempts(10);
    retry_with_backoff(&retry, "create_kube_client", move || async move {
        let client = create_client_with_timeout(
            kubeconfig,
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_READ_TIMEOUT,
        )
        .await?;
        // Config loading is lazy, so prove the endpoint answers
        client.apiserver_version().await?;
        Ok::<_, Error>(client)
    })
    .await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(Client::try_from(config)?)
}

/// Wait for every node to report Ready
pub async fn wait_for_nodes_ready(
    client: &Client,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());

    poll_until(timeout, poll_interval, "cluster nodes", || async {
        let node_list = nodes.list(&ListParams::default()).await?;
        if node_list.items.is_empty() {
            return Ok(false);
        }
        Ok(node_list.items.iter().all(|node| {
            let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
            has_condition(conditions.map(|c| c.as_slice()), CONDITION_READY)
        }))
    })
    .await
}

/// Wait for a CRD to report Established, so its kind can be served
pub async fn wait_for_crd_established(
    client: &Client,
    crd_name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    poll_until(
        timeout,
        poll_interval,
        format!("CustomResourceDefinition/{}", crd_name),
        || async {
            let crd = crds.get(crd_name).await?;
            let conditions = crd.status.as_ref().and_then(|s| s.conditions.as_ref());
            Ok(has_condition(
                conditions.map(|c| c.as_slice()),
                CONDITION_ESTABLISHED,
            ))
        },
    )
    .await
}

// =============================================================================
// Manifests
// =============================================================================

/// Parsed manifest metadata
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: Value,
    /// Resource name
    pub name: String,
    /// Namespace, if the manifest names one
    pub namespace: Option<String>,
    /// Group/version/kind of the manifest
    pub gvk: GroupVersionKind,
}

impl ManifestMetadata {
    /// `Kind/name`, as used in logs and error messages
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.gvk.kind, self.name)
    }
}

/// Extract metadata from an already-decoded manifest
pub fn manifest_metadata(value: Value) -> Result<ManifestMetadata, Error> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::manifest("manifest missing apiVersion"))?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::manifest("manifest missing kind"))?;
    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::manifest(format!("{} manifest missing metadata.name", kind)))?
        .to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    };

    Ok(ManifestMetadata {
        value,
        name,
        namespace,
        gvk,
    })
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use vap_library::kube_utils::parse_api_version;
///
/// assert_eq!(
///     parse_api_version("admissionregistration.k8s.io/v1"),
///     ("admissionregistration.k8s.io".to_string(), "v1".to_string())
/// );
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Apply ordering for setup manifests (lower = apply first)
///
/// Namespaces and CRDs come before anything that may live in them or be an
/// instance of them; admission objects come last so they never gate the
/// installation of their own prerequisites.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "ValidatingAdmissionPolicy" => 8,
        "ValidatingAdmissionPolicyBinding" => 9,
        _ => 6,
    }
}

// =============================================================================
// API resolution
// =============================================================================

/// A resolved API endpoint for one kind
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    /// The resource to address
    pub api_resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// Resolves GroupVersionKinds against cached API discovery.
///
/// Discovery is expensive, so results are cached and only re-run on a miss
/// (typically right after a CRD was installed).
pub struct ApiResolver {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl ApiResolver {
    /// Run discovery once and cache it
    pub async fn new(client: Client) -> Result<Self, Error> {
        let discovery = run_discovery(&client).await?;
        Ok(Self::with_discovery(client, discovery))
    }

    /// Resolver over an already-run (or deliberately empty) discovery
    pub fn with_discovery(client: Client, discovery: Discovery) -> Self {
        Self {
            client,
            discovery: RwLock::new(discovery),
        }
    }

    /// Client this resolver was created with
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve `gvk`, re-running discovery once if it is unknown
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind, Error> {
        if let Some(found) = self.lookup(gvk).await {
            return Ok(found);
        }

        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "unknown kind, refreshing discovery");
        self.refresh().await?;

        self.lookup(gvk).await.ok_or_else(|| {
            Error::manifest(format!(
                "unknown resource type {}/{} {}",
                gvk.group, gvk.version, gvk.kind
            ))
        })
    }

    /// Replace the cached discovery with a fresh run
    pub async fn refresh(&self) -> Result<(), Error> {
        let fresh = run_discovery(&self.client).await?;
        *self.discovery.write().await = fresh;
        Ok(())
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Option<ResolvedKind> {
        let discovery = self.discovery.read().await;
        discovery
            .resolve_gvk(gvk)
            .map(|(api_resource, caps)| ResolvedKind {
                api_resource,
                namespaced: matches!(caps.scope, Scope::Namespaced),
            })
    }

    /// Dynamic API for a resolved kind, scoped to `namespace` when namespaced
    pub fn api_for(&self, resolved: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match (resolved.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resolved.api_resource),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &resolved.api_resource),
            (false, _) => Api::all_with(self.client.clone(), &resolved.api_resource),
        }
    }

    /// Server-side apply a manifest, resolving its kind through discovery
    pub async fn apply(&self, manifest: &Value) -> Result<ManifestMetadata, Error> {
        let meta = manifest_metadata(manifest.clone())?;
        let resolved = self.resolve(&meta.gvk).await?;
        let api = self.api_for(&resolved, meta.namespace.as_deref());
        let params = PatchParams::apply(FIELD_MANAGER).force();

        api.patch(&meta.name, &params, &Patch::Apply(&meta.value))
            .await
            .map_err(|e| Error::install(meta.display_name(), e.to_string()))?;

        trace!(resource = %meta.display_name(), namespace = ?meta.namespace, "applied manifest");
        Ok(meta)
    }
}

/// Run API discovery with retry.
///
/// Uses a 1s initial backoff: discovery enumerates every API group and a
/// fresh API server is easy to overwhelm.
async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    };
    retry_with_backoff(&config, "api-discovery", || {
        let client = client.clone();
        async move { Ok::<_, Error>(Discovery::new(client).run().await?) }
    })
    .await
}
