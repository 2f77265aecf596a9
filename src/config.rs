//! Test environment configuration
//!
//! One [`EnvConfig`] describes everything a suite needs before its first
//! feature runs: which cluster to use, which policy bundle to install, which
//! labels opt generated namespaces into enforcement, and how long to wait for
//! the API server to catch up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scenario::DenialMatching;
use crate::{enforcement_label_key, Error, ENFORCE_LABEL_VALUE};

/// Default bound for every readiness wait
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);
/// Default interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default pause after the policy is observed, before the first probe.
///
/// The API server reports `observedGeneration` once the policy is compiled,
/// but the admission plugin picks it up through an informer a moment later.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Cluster name used when reusing a cluster without naming one
pub const DEFAULT_REUSE_CLUSTER_NAME: &str = "vap-library-dev";

/// Environment variable names understood by [`EnvConfig::from_env`]
pub mod vars {
    /// Path to a kubeconfig for an existing cluster
    pub const KUBECONFIG: &str = "VAP_KUBECONFIG";
    /// Reuse (and keep) a kind cluster across runs
    pub const REUSE_CLUSTER: &str = "VAP_REUSE_CLUSTER";
    /// Name of the reused kind cluster
    pub const CLUSTER_NAME: &str = "VAP_CLUSTER_NAME";
    /// kind node image override
    pub const KIND_NODE_IMAGE: &str = "VAP_KIND_NODE_IMAGE";
    /// Readiness timeout in seconds
    pub const READY_TIMEOUT_SECS: &str = "VAP_READY_TIMEOUT_SECS";
    /// Settle delay in milliseconds
    pub const SETTLE_DELAY_MS: &str = "VAP_SETTLE_DELAY_MS";
    /// Root directory holding `<policy>/policy.yaml`
    pub const POLICY_DIR: &str = "VAP_POLICY_DIR";
}

/// A directory of additional manifests applied before the policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraResources {
    /// Directory walked recursively
    pub dir: PathBuf,
    /// File name pattern, with at most one `*` wildcard
    pub pattern: String,
}

impl ExtraResources {
    /// All `*.yaml` files under `dir`
    pub fn yaml_files(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, "*.yaml")
    }

    /// Files under `dir` whose name matches `pattern`
    pub fn new(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.into(),
        }
    }

    /// Whether a file name matches this set's pattern
    pub fn matches(&self, file_name: &str) -> bool {
        match self.pattern.split_once('*') {
            Some((prefix, suffix)) => {
                file_name.len() >= prefix.len() + suffix.len()
                    && file_name.starts_with(prefix)
                    && file_name.ends_with(suffix)
            }
            None => file_name == self.pattern,
        }
    }
}

/// Configuration of one test environment
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// Name of the policy under test (directory name under `policies/`)
    pub policy_name: String,
    /// Directory holding `policy.yaml` and friends
    pub policy_dir: PathBuf,
    /// Existing cluster to use; `None` provisions a kind cluster
    pub kubeconfig: Option<PathBuf>,
    /// Reuse a named kind cluster and never tear it down
    pub reuse_existing: bool,
    /// Name of the reused cluster
    pub cluster_name: Option<String>,
    /// kind node image, when not the kind default
    pub node_image: Option<String>,
    /// Labels stamped on every generated namespace
    pub namespace_labels: BTreeMap<String, String>,
    /// Manifests applied before the policy
    pub extra_resources: Vec<ExtraResources>,
    /// Policy name -> whether its generated binding carries a `paramRef`
    pub bindings_to_generate: BTreeMap<String, bool>,
    /// Bound for every readiness wait
    pub ready_timeout: Duration,
    /// Interval between readiness checks
    pub poll_interval: Duration,
    /// Pause between policy readiness and the first probe
    pub settle_delay: Duration,
    /// How DENIED expectations are matched
    pub denial_matching: DenialMatching,
}

impl EnvConfig {
    /// Configuration for the bundle in `policies/<name>` of this repository.
    ///
    /// Generated namespaces get the `vap-library.com/<name>: deny` label so the
    /// bundle's bindings select them.
    pub fn for_policy(name: &str) -> Self {
        let policy_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("policies")
            .join(name);
        let mut namespace_labels = BTreeMap::new();
        namespace_labels.insert(
            enforcement_label_key(name),
            ENFORCE_LABEL_VALUE.to_string(),
        );

        Self {
            policy_name: name.to_string(),
            policy_dir,
            kubeconfig: None,
            reuse_existing: false,
            cluster_name: None,
            node_image: None,
            namespace_labels,
            extra_resources: Vec::new(),
            bindings_to_generate: BTreeMap::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            denial_matching: DenialMatching::default(),
        }
    }

    /// [`EnvConfig::for_policy`] with overrides from the process environment
    pub fn from_env(name: &str) -> Result<Self, Error> {
        Self::for_policy(name).with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup` (see [`vars`])
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(vars::KUBECONFIG) {
            self.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(flag) = get(vars::REUSE_CLUSTER) {
            self.reuse_existing = parse_bool(vars::REUSE_CLUSTER, &flag)?;
        }
        if let Some(name) = get(vars::CLUSTER_NAME) {
            self.cluster_name = Some(name);
        }
        if let Some(image) = get(vars::KIND_NODE_IMAGE) {
            self.node_image = Some(image);
        }
        if let Some(secs) = get(vars::READY_TIMEOUT_SECS) {
            self.ready_timeout = Duration::from_secs(parse_u64(vars::READY_TIMEOUT_SECS, &secs)?);
        }
        if let Some(ms) = get(vars::SETTLE_DELAY_MS) {
            self.settle_delay = Duration::from_millis(parse_u64(vars::SETTLE_DELAY_MS, &ms)?);
        }
        if let Some(root) = get(vars::POLICY_DIR) {
            self.policy_dir = PathBuf::from(root).join(&self.policy_name);
        }

        Ok(self)
    }

    /// Use an existing cluster
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Reuse (or create and keep) a named kind cluster
    pub fn reuse_cluster(mut self, name: impl Into<String>) -> Self {
        self.reuse_existing = true;
        self.cluster_name = Some(name.into());
        self
    }

    /// Add a label to every generated namespace
    pub fn namespace_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.namespace_labels.insert(key.into(), value.into());
        self
    }

    /// Apply extra manifests before the policy
    pub fn extra_resources(mut self, extra: ExtraResources) -> Self {
        self.extra_resources.push(extra);
        self
    }

    /// Generate a binding for `policy`, with a `paramRef` when `with_params`
    pub fn generate_binding(mut self, policy: impl Into<String>, with_params: bool) -> Self {
        self.bindings_to_generate.insert(policy.into(), with_params);
        self
    }

    /// Override the readiness timeout
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Override the settle delay
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Override how DENIED expectations are matched
    pub fn denial_matching(mut self, matching: DenialMatching) -> Self {
        self.denial_matching = matching;
        self
    }

    /// Cluster name to use when reusing a cluster
    pub fn reuse_cluster_name(&self) -> &str {
        self.cluster_name
            .as_deref()
            .unwrap_or(DEFAULT_REUSE_CLUSTER_NAME)
    }

    /// Check the configuration is usable before touching any cluster
    pub fn validate(&self) -> Result<(), Error> {
        if self.policy_name.is_empty() {
            return Err(Error::config("policy name must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be non-zero"));
        }
        if self.poll_interval > self.ready_timeout {
            return Err(Error::config(format!(
                "poll interval {:?} exceeds ready timeout {:?}",
                self.poll_interval, self.ready_timeout
            )));
        }
        if let Some(path) = &self.kubeconfig {
            if !path.is_file() {
                return Err(Error::config(format!(
                    "kubeconfig {} does not exist",
                    path.display()
                )));
            }
        }
        for extra in &self.extra_resources {
            if !extra.dir.is_dir() {
                return Err(Error::config(format!(
                    "extra resources directory {} does not exist",
                    extra.dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, Error> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::config(format!("{key} must be a boolean, got {other:?}"))),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, Error> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{key} must be a whole number, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn for_policy_opts_namespaces_into_enforcement() {
        let config = EnvConfig::for_policy("pss-capabilities");
        assert_eq!(
            config.namespace_labels.get("vap-library.com/pss-capabilities"),
            Some(&"deny".to_string())
        );
        assert!(config.policy_dir.ends_with("policies/pss-capabilities"));
        assert_eq!(config.ready_timeout, DEFAULT_READY_TIMEOUT);
        assert_eq!(config.denial_matching, DenialMatching::Strict);
        assert!(config.kubeconfig.is_none());
    }

    #[test]
    fn builder_records_generated_bindings_and_labels() {
        let config = EnvConfig::for_policy("resource-limit-types")
            .generate_binding("resource-limit-types", true)
            .namespace_label("team", "a")
            .reuse_cluster("ci");
        assert_eq!(config.bindings_to_generate.get("resource-limit-types"), Some(&true));
        assert_eq!(config.namespace_labels.len(), 2);
        assert!(config.reuse_existing);
        assert_eq!(config.reuse_cluster_name(), "ci");
    }

    #[test]
    fn overrides_are_read_from_lookup() {
        let config = EnvConfig::for_policy("service-type")
            .with_overrides(lookup(&[
                (vars::KUBECONFIG, "/tmp/kubeconfig"),
                (vars::REUSE_CLUSTER, "true"),
                (vars::READY_TIMEOUT_SECS, "30"),
                (vars::SETTLE_DELAY_MS, "0"),
                (vars::KIND_NODE_IMAGE, "kindest/node:v1.31.0"),
                (vars::POLICY_DIR, "/srv/policies"),
            ]))
            .unwrap();
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        assert!(config.reuse_existing);
        assert_eq!(config.reuse_cluster_name(), DEFAULT_REUSE_CLUSTER_NAME);
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert!(config.settle_delay.is_zero());
        assert_eq!(config.node_image.as_deref(), Some("kindest/node:v1.31.0"));
        assert_eq!(config.policy_dir, PathBuf::from("/srv/policies/service-type"));
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let config = EnvConfig::for_policy("x")
            .with_overrides(lookup(&[(vars::KUBECONFIG, "  ")]))
            .unwrap();
        assert!(config.kubeconfig.is_none());
    }

    #[test]
    fn malformed_overrides_are_config_errors() {
        let err = EnvConfig::for_policy("x")
            .with_overrides(lookup(&[(vars::READY_TIMEOUT_SECS, "two minutes")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains(vars::READY_TIMEOUT_SECS));

        let err = EnvConfig::for_policy("x")
            .with_overrides(lookup(&[(vars::REUSE_CLUSTER, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn validate_rejects_missing_paths() {
        let config = EnvConfig::for_policy("x").kubeconfig("/definitely/not/here");
        assert!(config.validate().is_err());

        let config = EnvConfig::for_policy("x")
            .extra_resources(ExtraResources::yaml_files("/definitely/not/here"));
        assert!(config.validate().is_err());

        assert!(EnvConfig::for_policy("x").validate().is_ok());
    }

    #[test]
    fn extra_resource_patterns() {
        let extra = ExtraResources::yaml_files("/crds");
        assert!(extra.matches("helmrelease.yaml"));
        assert!(!extra.matches("helmrelease.yml"));
        assert!(!extra.matches("README.md"));

        let extra = ExtraResources::new("/crds", "gateway-*.yaml");
        assert!(extra.matches("gateway-httproute.yaml"));
        assert!(!extra.matches("flux-helmrelease.yaml"));

        let extra = ExtraResources::new("/crds", "crd.yaml");
        assert!(extra.matches("crd.yaml"));
        assert!(!extra.matches("other.yaml"));
    }
}
