//! Policy bundles and their installation
//!
//! A bundle is a directory under `policies/`:
//!
//! ```text
//! policies/<name>/
//!   policy.yaml          ValidatingAdmissionPolicy (required)
//!   binding.yaml         ValidatingAdmissionPolicyBinding(s) (optional)
//!   crd-parameter.yaml   parameter CRD (optional)
//! ```
//!
//! Installation order matters: CRDs must be Established before instances of
//! them are accepted, and a binding is only useful once its policy has been
//! compiled. Every step is confirmed with a bounded poll before the next one
//! starts, so no scenario ever probes a half-installed policy.

use std::path::{Path, PathBuf};

use k8s_openapi::api::admissionregistration::v1::{
    ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding,
};
use kube::api::{Api, DeleteParams};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{EnvConfig, ExtraResources};
use crate::kube_utils::{
    kind_priority, manifest_metadata, poll_until, wait_for_crd_established, ApiResolver,
};
use crate::yaml::parse_documents;
use crate::{enforcement_label_key, policy_object_name, Error, ENFORCE_LABEL_VALUE};

/// Policy file name inside a bundle
pub const POLICY_FILE: &str = "policy.yaml";
/// Binding file name inside a bundle
pub const BINDING_FILE: &str = "binding.yaml";
/// Parameter CRD file name inside a bundle
pub const PARAMETER_CRD_FILE: &str = "crd-parameter.yaml";

const KIND_POLICY: &str = "ValidatingAdmissionPolicy";
const KIND_BINDING: &str = "ValidatingAdmissionPolicyBinding";
const KIND_CRD: &str = "CustomResourceDefinition";

/// The manifests of one `policies/<name>` directory
#[derive(Clone, Debug)]
pub struct PolicyBundle {
    /// Bundle (directory) name
    pub name: String,
    /// The ValidatingAdmissionPolicy
    pub policy: Value,
    /// Bindings shipped with the bundle
    pub bindings: Vec<Value>,
    /// Parameter CRD, for parameterised policies
    pub parameter_crd: Option<Value>,
}

impl PolicyBundle {
    /// Load the bundle in `dir`
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("{} is not a bundle directory", dir.display())))?;

        let policy_path = dir.join(POLICY_FILE);
        if !policy_path.is_file() {
            return Err(Error::config(format!(
                "policy bundle {} has no {}",
                dir.display(),
                POLICY_FILE
            )));
        }
        let policy = read_documents(&policy_path)?
            .into_iter()
            .find(|doc| kind_of(doc) == Some(KIND_POLICY))
            .ok_or_else(|| {
                Error::manifest(format!(
                    "{} contains no {}",
                    policy_path.display(),
                    KIND_POLICY
                ))
            })?;

        let bindings = read_optional(&dir.join(BINDING_FILE))?
            .into_iter()
            .filter(|doc| kind_of(doc) == Some(KIND_BINDING))
            .collect();

        let parameter_crd = read_optional(&dir.join(PARAMETER_CRD_FILE))?
            .into_iter()
            .find(|doc| kind_of(doc) == Some(KIND_CRD));

        Ok(Self {
            name,
            policy,
            bindings,
            parameter_crd,
        })
    }

    /// `metadata.name` of the policy object
    pub fn policy_name(&self) -> Option<&str> {
        self.policy.pointer("/metadata/name").and_then(Value::as_str)
    }
}

/// Binding for `policy` selecting namespaces labeled
/// `vap-library.com/<policy>: deny`, optionally referencing the parameter
/// object named like the policy.
pub fn generate_binding(policy: &str, with_params: bool) -> Value {
    let mut binding = json!({
        "apiVersion": "admissionregistration.k8s.io/v1",
        "kind": KIND_BINDING,
        "metadata": { "name": format!("{}-binding", policy) },
        "spec": {
            "policyName": policy_object_name(policy),
            "validationActions": ["Deny"],
            "matchResources": {
                "namespaceSelector": {
                    "matchLabels": { enforcement_label_key(policy): ENFORCE_LABEL_VALUE }
                }
            }
        }
    });
    if with_params {
        binding["spec"]["paramRef"] = json!({
            "name": policy_object_name(policy),
            "parameterNotFoundAction": "Deny",
        });
    }
    binding
}

/// Everything installed into the cluster before the first feature runs
#[derive(Clone, Debug, Default)]
pub struct PolicyInstallationSet {
    /// Additional manifests, applied first in kind priority order
    pub extra_resources: Vec<Value>,
    /// Parameter CRDs
    pub parameter_crds: Vec<Value>,
    /// ValidatingAdmissionPolicies
    pub policies: Vec<Value>,
    /// Bindings, shipped and generated
    pub bindings: Vec<Value>,
}

impl PolicyInstallationSet {
    /// Collect the bundle, extra resources and generated bindings of `config`
    pub fn from_config(config: &EnvConfig) -> Result<Self, Error> {
        let bundle = PolicyBundle::load(&config.policy_dir)?;

        let mut extra_resources = Vec::new();
        for extra in &config.extra_resources {
            extra_resources.extend(load_extra_resources(extra)?);
        }
        extra_resources.sort_by_key(|doc| kind_priority(kind_of(doc).unwrap_or_default()));

        let mut bindings = bundle.bindings;
        for (policy, with_params) in &config.bindings_to_generate {
            let generated = generate_binding(policy, *with_params);
            // A generated binding replaces a shipped one of the same name
            bindings.retain(|b| name_of(b) != name_of(&generated));
            bindings.push(generated);
        }

        Ok(Self {
            extra_resources,
            parameter_crds: bundle.parameter_crd.into_iter().collect(),
            policies: vec![bundle.policy],
            bindings,
        })
    }

    /// Apply everything and wait until the policy is enforceable
    pub async fn install(&self, resolver: &ApiResolver, config: &EnvConfig) -> Result<(), Error> {
        let timeout = config.ready_timeout;
        let interval = config.poll_interval;
        let client = resolver.client();

        if !self.extra_resources.is_empty() {
            info!(count = self.extra_resources.len(), "applying extra resources");
            for manifest in &self.extra_resources {
                resolver.apply(manifest).await?;
            }
            self.wait_for_crds(resolver, &self.extra_resources, config).await?;
        }

        for crd in &self.parameter_crds {
            let meta = resolver.apply(crd).await?;
            info!(crd = %meta.name, "applied parameter CRD");
        }
        self.wait_for_crds(resolver, &self.parameter_crds, config).await?;

        let policies: Api<ValidatingAdmissionPolicy> = Api::all(client.clone());
        for policy in &self.policies {
            let meta = resolver.apply(policy).await?;
            info!(policy = %meta.name, "applied policy");
            poll_until(
                timeout,
                interval,
                format!("{}/{}", KIND_POLICY, meta.name),
                || async {
                    let current = policies.get(&meta.name).await?;
                    Ok(policy_observed(&current))
                },
            )
            .await?;
        }

        let bindings: Api<ValidatingAdmissionPolicyBinding> = Api::all(client.clone());
        for binding in &self.bindings {
            if let Ok(rendered) = serde_yaml::to_string(binding) {
                debug!("binding manifest:\n{}", rendered);
            }
            let meta = resolver.apply(binding).await?;
            info!(binding = %meta.name, "applied binding");
            poll_until(
                timeout,
                interval,
                format!("{}/{}", KIND_BINDING, meta.name),
                || async { Ok(bindings.get_opt(&meta.name).await?.is_some()) },
            )
            .await?;
        }

        if !config.settle_delay.is_zero() {
            debug!(delay_ms = config.settle_delay.as_millis() as u64, "waiting for admission plugin to sync");
            tokio::time::sleep(config.settle_delay).await;
        }
        Ok(())
    }

    /// Delete bindings and policies again (best effort), for clusters that
    /// outlive the run
    pub async fn uninstall(&self, resolver: &ApiResolver) {
        let client = resolver.client();
        let bindings: Api<ValidatingAdmissionPolicyBinding> = Api::all(client.clone());
        let policies: Api<ValidatingAdmissionPolicy> = Api::all(client.clone());

        for name in self.bindings.iter().filter_map(name_of) {
            if let Err(e) = bindings.delete(name, &DeleteParams::default()).await {
                warn!(binding = %name, error = %e, "failed to delete binding");
            }
        }
        for name in self.policies.iter().filter_map(name_of) {
            if let Err(e) = policies.delete(name, &DeleteParams::default()).await {
                warn!(policy = %name, error = %e, "failed to delete policy");
            }
        }
    }

    async fn wait_for_crds(
        &self,
        resolver: &ApiResolver,
        manifests: &[Value],
        config: &EnvConfig,
    ) -> Result<(), Error> {
        let crds: Vec<&str> = manifests
            .iter()
            .filter(|doc| kind_of(doc) == Some(KIND_CRD))
            .filter_map(name_of)
            .collect();
        if crds.is_empty() {
            return Ok(());
        }
        for crd in &crds {
            wait_for_crd_established(
                resolver.client(),
                crd,
                config.ready_timeout,
                config.poll_interval,
            )
            .await?;
        }
        // New kinds are invisible to the cached discovery until refreshed
        resolver.refresh().await
    }
}

/// Whether the API server has compiled the current generation of `policy`
pub fn policy_observed(policy: &ValidatingAdmissionPolicy) -> bool {
    let Some(generation) = policy.metadata.generation else {
        return false;
    };
    policy
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .is_some_and(|observed| observed >= generation)
}

fn load_extra_resources(extra: &ExtraResources) -> Result<Vec<Value>, Error> {
    let mut files: Vec<PathBuf> = WalkDir::new(&extra.dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(dir = %extra.dir.display(), error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| extra.matches(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut docs = Vec::new();
    for file in files {
        debug!(file = %file.display(), "loading extra resources");
        for doc in read_documents(&file)? {
            // Validate up front so a bad vendored file fails before install
            manifest_metadata(doc.clone())
                .map_err(|e| Error::manifest(format!("{}: {}", file.display(), e)))?;
            docs.push(doc);
        }
    }
    Ok(docs)
}

fn read_documents(path: &Path) -> Result<Vec<Value>, Error> {
    let content = std::fs::read_to_string(path)?;
    parse_documents(&content)
        .map_err(|e| Error::manifest(format!("{}: {}", path.display(), e)))
}

fn read_optional(path: &Path) -> Result<Vec<Value>, Error> {
    if path.is_file() {
        read_documents(path)
    } else {
        Ok(Vec::new())
    }
}

fn kind_of(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(Value::as_str)
}

fn name_of(doc: &Value) -> Option<&str> {
    doc.pointer("/metadata/name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::admissionregistration::v1::ValidatingAdmissionPolicyStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::fs;
    use tempfile::TempDir;

    const POLICY: &str = r#"
apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingAdmissionPolicy
metadata:
  name: demo.vap-library.com
spec:
  failurePolicy: Fail
  matchConstraints:
    resourceRules:
    - apiGroups: [""]
      apiVersions: ["v1"]
      operations: ["CREATE"]
      resources: ["services"]
  validations:
  - expression: "object.spec.type != 'NodePort'"
"#;

    const BINDINGS: &str = r#"
apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingAdmissionPolicyBinding
metadata:
  name: demo-binding
spec:
  policyName: demo.vap-library.com
  validationActions: [Deny]
---
apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingAdmissionPolicyBinding
metadata:
  name: demo-audit
spec:
  policyName: demo.vap-library.com
  validationActions: [Audit]
"#;

    const CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: demoparams.vap-library.com
spec:
  group: vap-library.com
  names:
    kind: DemoParam
    plural: demoparams
  scope: Namespaced
  versions: []
"#;

    fn bundle_dir(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("demo");
        fs::create_dir(&dir).unwrap();
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
        (tmp, dir)
    }

    #[test]
    fn generated_binding_matches_release_shape() {
        let binding = generate_binding("pss-capabilities", false);
        assert_eq!(binding["kind"], "ValidatingAdmissionPolicyBinding");
        assert_eq!(binding["apiVersion"], "admissionregistration.k8s.io/v1");
        assert_eq!(binding["metadata"]["name"], "pss-capabilities-binding");
        assert_eq!(binding["spec"]["policyName"], "pss-capabilities.vap-library.com");
        assert_eq!(binding["spec"]["validationActions"], json!(["Deny"]));
        assert_eq!(
            binding["spec"]["matchResources"]["namespaceSelector"]["matchLabels"],
            json!({"vap-library.com/pss-capabilities": "deny"})
        );
        assert!(binding["spec"].get("paramRef").is_none());
    }

    #[test]
    fn parameterised_binding_references_its_parameter() {
        let binding = generate_binding("resource-limit-types", true);
        assert_eq!(
            binding["spec"]["paramRef"],
            json!({
                "name": "resource-limit-types.vap-library.com",
                "parameterNotFoundAction": "Deny"
            })
        );
    }

    #[test]
    fn bundle_with_every_file() {
        let (_tmp, dir) = bundle_dir(&[
            (POLICY_FILE, POLICY),
            (BINDING_FILE, BINDINGS),
            (PARAMETER_CRD_FILE, CRD),
        ]);
        let bundle = PolicyBundle::load(&dir).unwrap();
        assert_eq!(bundle.name, "demo");
        assert_eq!(bundle.policy_name(), Some("demo.vap-library.com"));
        assert_eq!(bundle.bindings.len(), 2);
        assert_eq!(
            bundle.parameter_crd.as_ref().and_then(name_of),
            Some("demoparams.vap-library.com")
        );
    }

    #[test]
    fn bundle_with_policy_only() {
        let (_tmp, dir) = bundle_dir(&[(POLICY_FILE, POLICY)]);
        let bundle = PolicyBundle::load(&dir).unwrap();
        assert!(bundle.bindings.is_empty());
        assert!(bundle.parameter_crd.is_none());
    }

    #[test]
    fn bundle_without_policy_is_rejected() {
        let (_tmp, dir) = bundle_dir(&[(BINDING_FILE, BINDINGS)]);
        let err = PolicyBundle::load(&dir).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains(POLICY_FILE));
    }

    #[test]
    fn policy_file_without_a_policy_is_rejected() {
        let (_tmp, dir) = bundle_dir(&[(POLICY_FILE, CRD)]);
        let err = PolicyBundle::load(&dir).unwrap_err();
        assert!(err.to_string().contains("contains no ValidatingAdmissionPolicy"));
    }

    #[test]
    fn installation_set_merges_generated_bindings() {
        let (_tmp, dir) = bundle_dir(&[(POLICY_FILE, POLICY), (BINDING_FILE, BINDINGS)]);
        let mut config = EnvConfig::for_policy("demo")
            .generate_binding("demo", false)
            .generate_binding("other", true);
        config.policy_dir = dir;

        let set = PolicyInstallationSet::from_config(&config).unwrap();
        assert_eq!(set.policies.len(), 1);
        let names: Vec<_> = set.bindings.iter().filter_map(name_of).collect();
        // demo-binding is replaced by the generated one, not duplicated
        assert_eq!(names, vec!["demo-audit", "demo-binding", "other-binding"]);
        let demo = set
            .bindings
            .iter()
            .find(|b| name_of(b) == Some("demo-binding"))
            .unwrap();
        assert!(demo["spec"].get("matchResources").is_some());
    }

    #[test]
    fn extra_resources_are_filtered_and_ordered() {
        let (tmp, dir) = bundle_dir(&[(POLICY_FILE, POLICY)]);
        let extra = tmp.path().join("crds");
        fs::create_dir_all(extra.join("nested")).unwrap();
        fs::write(
            extra.join("a-namespace.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: flux-system\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: flux-system\n",
        )
        .unwrap();
        fs::write(extra.join("nested").join("b-crd.yaml"), CRD).unwrap();
        fs::write(extra.join("README.md"), "not yaml: [").unwrap();

        let mut config =
            EnvConfig::for_policy("demo").extra_resources(ExtraResources::yaml_files(&extra));
        config.policy_dir = dir;

        let set = PolicyInstallationSet::from_config(&config).unwrap();
        let kinds: Vec<_> = set.extra_resources.iter().filter_map(kind_of).collect();
        assert_eq!(kinds, vec!["Namespace", "CustomResourceDefinition", "ConfigMap"]);
    }

    #[test]
    fn malformed_extra_resource_fails_early() {
        let (tmp, dir) = bundle_dir(&[(POLICY_FILE, POLICY)]);
        let extra = tmp.path().join("extra");
        fs::create_dir(&extra).unwrap();
        fs::write(extra.join("broken.yaml"), "kind: ConfigMap\n").unwrap();

        let mut config =
            EnvConfig::for_policy("demo").extra_resources(ExtraResources::yaml_files(&extra));
        config.policy_dir = dir;

        let err = PolicyInstallationSet::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn policy_is_observed_once_status_catches_up() {
        let mut policy = ValidatingAdmissionPolicy {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!policy_observed(&policy));

        policy.status = Some(ValidatingAdmissionPolicyStatus {
            observed_generation: Some(1),
            ..Default::default()
        });
        assert!(!policy_observed(&policy));

        policy.status = Some(ValidatingAdmissionPolicyStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(policy_observed(&policy));
    }
}
