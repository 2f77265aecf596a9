//! Workload manifests for every pod-bearing kind
//!
//! Policies that inspect pod specs have to be exercised through every kind
//! that embeds one. Rather than one hand-written skeleton per kind, a
//! [`WorkloadBuilder`] renders the kind's controller boilerplate and drops the
//! pod spec at [`WorkloadKind::pod_spec_pointer`].

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, PodSecurityContext, ResourceRequirements, SeccompProfile,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::{json, Map, Value};

use super::insert_at_pointer;
use crate::{Error, DEFAULT_TEST_IMAGE};

/// Schedule given to generated CronJobs (never expected to fire during a run)
pub const CRONJOB_SCHEDULE: &str = "0 0 1 1 *";

/// Label used for selectors and pod template labels
pub const APP_LABEL: &str = "app";

/// Every kind that embeds a pod spec
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    /// core/v1 Pod
    Pod,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// batch/v1 Job
    Job,
    /// batch/v1 CronJob
    CronJob,
    /// core/v1 ReplicationController
    ReplicationController,
    /// core/v1 PodTemplate
    PodTemplate,
}

impl WorkloadKind {
    /// All kinds, in the order suites cover them
    pub const ALL: [WorkloadKind; 9] = [
        WorkloadKind::Pod,
        WorkloadKind::Deployment,
        WorkloadKind::ReplicaSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
        WorkloadKind::ReplicationController,
        WorkloadKind::PodTemplate,
    ];

    /// apiVersion of the kind
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Pod | Self::ReplicationController | Self::PodTemplate => "v1",
            Self::Deployment | Self::ReplicaSet | Self::DaemonSet | Self::StatefulSet => "apps/v1",
            Self::Job | Self::CronJob => "batch/v1",
        }
    }

    /// Kind name as the API spells it
    pub fn kind(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::ReplicationController => "ReplicationController",
            Self::PodTemplate => "PodTemplate",
        }
    }

    /// Lowercase name, usable inside object names
    pub fn slug(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Deployment => "deployment",
            Self::ReplicaSet => "replicaset",
            Self::DaemonSet => "daemonset",
            Self::StatefulSet => "statefulset",
            Self::Job => "job",
            Self::CronJob => "cronjob",
            Self::ReplicationController => "replicationcontroller",
            Self::PodTemplate => "podtemplate",
        }
    }

    /// JSON pointer to the embedded pod spec
    pub fn pod_spec_pointer(self) -> &'static str {
        match self {
            Self::Pod => "/spec",
            Self::Deployment
            | Self::ReplicaSet
            | Self::DaemonSet
            | Self::StatefulSet
            | Self::Job
            | Self::ReplicationController => "/spec/template/spec",
            Self::CronJob => "/spec/jobTemplate/spec/template/spec",
            Self::PodTemplate => "/template/spec",
        }
    }

    /// Restart policy the kind requires, if the default is not accepted
    fn restart_policy(self) -> Option<&'static str> {
        match self {
            Self::Job | Self::CronJob => Some("Never"),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// =============================================================================
// Containers
// =============================================================================

/// One container of a generated pod spec
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    container: Container,
}

impl ContainerSpec {
    /// Container running the default test image
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            container: Container {
                name: name.into(),
                image: Some(DEFAULT_TEST_IMAGE.to_string()),
                ..Default::default()
            },
        }
    }

    /// Override the image
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.container.image = Some(image.into());
        self
    }

    /// Set both capability lists
    pub fn capabilities(self, drop: &[&str], add: &[&str]) -> Self {
        self.drop_capabilities(drop).add_capabilities(add)
    }

    /// Set `securityContext.capabilities.drop`
    pub fn drop_capabilities(mut self, drop: &[&str]) -> Self {
        self.capabilities_mut().drop = Some(to_strings(drop));
        self
    }

    /// Set `securityContext.capabilities.add`
    pub fn add_capabilities(mut self, add: &[&str]) -> Self {
        self.capabilities_mut().add = Some(to_strings(add));
        self
    }

    /// Set `securityContext.allowPrivilegeEscalation`
    pub fn allow_privilege_escalation(mut self, allow: bool) -> Self {
        self.security_context_mut().allow_privilege_escalation = Some(allow);
        self
    }

    /// Set `securityContext.runAsNonRoot`
    pub fn run_as_non_root(mut self, non_root: bool) -> Self {
        self.security_context_mut().run_as_non_root = Some(non_root);
        self
    }

    /// Set `securityContext.runAsUser`
    pub fn run_as_user(mut self, uid: i64) -> Self {
        self.security_context_mut().run_as_user = Some(uid);
        self
    }

    /// Set `securityContext.seccompProfile.type`
    pub fn seccomp_profile(mut self, profile_type: impl Into<String>) -> Self {
        self.security_context_mut().seccomp_profile = Some(seccomp(profile_type));
        self
    }

    /// Add an entry to `resources.limits`
    pub fn limit(mut self, resource: impl Into<String>, quantity: impl Into<String>) -> Self {
        self.resources_mut()
            .limits
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), Quantity(quantity.into()));
        self
    }

    /// Add an entry to `resources.requests`
    pub fn request(mut self, resource: impl Into<String>, quantity: impl Into<String>) -> Self {
        self.resources_mut()
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), Quantity(quantity.into()));
        self
    }

    /// Container name
    pub fn name(&self) -> &str {
        &self.container.name
    }

    /// The underlying container
    pub fn as_container(&self) -> &Container {
        &self.container
    }

    fn security_context_mut(&mut self) -> &mut SecurityContext {
        self.container
            .security_context
            .get_or_insert_with(SecurityContext::default)
    }

    fn capabilities_mut(&mut self) -> &mut Capabilities {
        self.security_context_mut()
            .capabilities
            .get_or_insert_with(Capabilities::default)
    }

    fn resources_mut(&mut self) -> &mut ResourceRequirements {
        self.container
            .resources
            .get_or_insert_with(ResourceRequirements::default)
    }
}

/// Pod-level security defaults (`<pod spec>/securityContext`)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSecurityContextSpec {
    context: PodSecurityContext,
}

impl PodSecurityContextSpec {
    /// Empty pod security context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `runAsNonRoot`
    pub fn run_as_non_root(mut self, non_root: bool) -> Self {
        self.context.run_as_non_root = Some(non_root);
        self
    }

    /// Set `runAsUser`
    pub fn run_as_user(mut self, uid: i64) -> Self {
        self.context.run_as_user = Some(uid);
        self
    }

    /// Set `seccompProfile.type`
    pub fn seccomp_profile(mut self, profile_type: impl Into<String>) -> Self {
        self.context.seccomp_profile = Some(seccomp(profile_type));
        self
    }
}

fn seccomp(profile_type: impl Into<String>) -> SeccompProfile {
    SeccompProfile {
        type_: profile_type.into(),
        ..Default::default()
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::manifest(format!("serialize failed: {}", e)))
}

// =============================================================================
// Workloads
// =============================================================================

/// Builds a workload of any [`WorkloadKind`]
#[derive(Clone, Debug)]
pub struct WorkloadBuilder {
    kind: WorkloadKind,
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    containers: Vec<ContainerSpec>,
    init_containers: Vec<ContainerSpec>,
    pod_security: Option<PodSecurityContextSpec>,
    pod_spec_fields: Map<String, Value>,
}

impl WorkloadBuilder {
    /// Workload named `name` with no containers yet
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
            labels: BTreeMap::new(),
            containers: Vec::new(),
            init_containers: Vec::new(),
            pod_security: None,
            pod_spec_fields: Map::new(),
        }
    }

    /// Set `metadata.namespace` (the probe injects it otherwise)
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add an object label
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Append a container
    pub fn container(mut self, container: ContainerSpec) -> Self {
        self.containers.push(container);
        self
    }

    /// Append an init container
    pub fn init_container(mut self, container: ContainerSpec) -> Self {
        self.init_containers.push(container);
        self
    }

    /// Set the pod-level security context
    pub fn pod_security_context(mut self, context: PodSecurityContextSpec) -> Self {
        self.pod_security = Some(context);
        self
    }

    /// Set an arbitrary pod spec field (e.g. `serviceAccountName`, `volumes`)
    pub fn pod_spec_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.pod_spec_fields.insert(key.into(), value);
        self
    }

    /// Kind being built
    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the manifest
    pub fn build(&self) -> Result<Value, Error> {
        let mut manifest = self.skeleton();
        insert_at_pointer(&mut manifest, self.kind.pod_spec_pointer(), self.pod_spec()?)?;
        Ok(manifest)
    }

    fn pod_spec(&self) -> Result<Value, Error> {
        let mut spec = Map::new();

        let containers = self
            .containers
            .iter()
            .map(|c| to_json(c.as_container()))
            .collect::<Result<Vec<_>, _>>()?;
        spec.insert("containers".to_string(), Value::Array(containers));

        if !self.init_containers.is_empty() {
            let init = self
                .init_containers
                .iter()
                .map(|c| to_json(c.as_container()))
                .collect::<Result<Vec<_>, _>>()?;
            spec.insert("initContainers".to_string(), Value::Array(init));
        }

        if let Some(ctx) = &self.pod_security {
            spec.insert("securityContext".to_string(), to_json(&ctx.context)?);
        }

        if let Some(policy) = self.kind.restart_policy() {
            spec.insert("restartPolicy".to_string(), json!(policy));
        }

        for (key, value) in &self.pod_spec_fields {
            spec.insert(key.clone(), value.clone());
        }

        Ok(Value::Object(spec))
    }

    fn metadata(&self) -> Value {
        let mut metadata = json!({ "name": self.name });
        if let Some(ns) = &self.namespace {
            metadata["namespace"] = json!(ns);
        }
        if !self.labels.is_empty() {
            metadata["labels"] = json!(self.labels);
        }
        metadata
    }

    fn skeleton(&self) -> Value {
        let selector = json!({ APP_LABEL: self.name });
        let template = json!({ "metadata": { "labels": selector } });

        let spec = match self.kind {
            WorkloadKind::Pod => json!({}),
            WorkloadKind::Deployment | WorkloadKind::ReplicaSet => json!({
                "replicas": 1,
                "selector": { "matchLabels": selector },
                "template": template.clone(),
            }),
            WorkloadKind::DaemonSet => json!({
                "selector": { "matchLabels": selector },
                "template": template.clone(),
            }),
            WorkloadKind::StatefulSet => json!({
                "replicas": 1,
                "serviceName": self.name,
                "selector": { "matchLabels": selector },
                "template": template.clone(),
            }),
            WorkloadKind::Job => json!({
                "backoffLimit": 0,
                "template": template.clone(),
            }),
            WorkloadKind::CronJob => json!({
                "schedule": CRONJOB_SCHEDULE,
                "jobTemplate": {
                    "spec": {
                        "backoffLimit": 0,
                        "template": template.clone(),
                    }
                },
            }),
            WorkloadKind::ReplicationController => json!({
                "replicas": 1,
                "selector": selector,
                "template": template.clone(),
            }),
            WorkloadKind::PodTemplate => Value::Null,
        };

        let mut manifest = json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.kind(),
            "metadata": self.metadata(),
        });
        match self.kind {
            // PodTemplate has no spec; the template sits at the top level
            WorkloadKind::PodTemplate => manifest["template"] = template.clone(),
            _ => manifest["spec"] = spec,
        }
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn capability_pod(kind: WorkloadKind) -> Value {
        WorkloadBuilder::new(kind, "capabilities-success")
            .container(ContainerSpec::new("capabilities").capabilities(&["ALL"], &["NET_BIND_SERVICE"]))
            .build()
            .expect("workload should build")
    }

    #[rstest]
    #[case(WorkloadKind::Pod, "/spec")]
    #[case(WorkloadKind::Deployment, "/spec/template/spec")]
    #[case(WorkloadKind::ReplicaSet, "/spec/template/spec")]
    #[case(WorkloadKind::DaemonSet, "/spec/template/spec")]
    #[case(WorkloadKind::StatefulSet, "/spec/template/spec")]
    #[case(WorkloadKind::Job, "/spec/template/spec")]
    #[case(WorkloadKind::CronJob, "/spec/jobTemplate/spec/template/spec")]
    #[case(WorkloadKind::ReplicationController, "/spec/template/spec")]
    #[case(WorkloadKind::PodTemplate, "/template/spec")]
    fn container_lands_at_the_kinds_pod_spec(#[case] kind: WorkloadKind, #[case] pointer: &str) {
        assert_eq!(kind.pod_spec_pointer(), pointer);

        let manifest = capability_pod(kind);
        let caps = manifest
            .pointer(&format!("{}/containers/0/securityContext/capabilities", pointer))
            .expect("capabilities at pod spec pointer");
        assert_eq!(caps["drop"], json!(["ALL"]));
        assert_eq!(caps["add"], json!(["NET_BIND_SERVICE"]));
        assert_eq!(manifest["kind"], kind.kind());
        assert_eq!(manifest["apiVersion"], kind.api_version());
        assert_eq!(manifest["metadata"]["name"], "capabilities-success");
    }

    #[test]
    fn all_covers_nine_distinct_kinds() {
        let mut slugs: Vec<_> = WorkloadKind::ALL.iter().map(|k| k.slug()).collect();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), 9);
    }

    #[test]
    fn controllers_select_their_own_template() {
        for kind in [
            WorkloadKind::Deployment,
            WorkloadKind::ReplicaSet,
            WorkloadKind::DaemonSet,
            WorkloadKind::StatefulSet,
        ] {
            let manifest = capability_pod(kind);
            assert_eq!(
                manifest["spec"]["selector"]["matchLabels"],
                manifest["spec"]["template"]["metadata"]["labels"],
                "{kind} selector must match its template"
            );
        }

        let rc = capability_pod(WorkloadKind::ReplicationController);
        assert_eq!(rc["spec"]["selector"], json!({"app": "capabilities-success"}));
    }

    #[test]
    fn kind_specific_boilerplate() {
        let sts = capability_pod(WorkloadKind::StatefulSet);
        assert_eq!(sts["spec"]["serviceName"], "capabilities-success");

        let ds = capability_pod(WorkloadKind::DaemonSet);
        assert!(ds["spec"].get("replicas").is_none());

        let job = capability_pod(WorkloadKind::Job);
        assert_eq!(job["spec"]["template"]["spec"]["restartPolicy"], "Never");

        let cron = capability_pod(WorkloadKind::CronJob);
        assert_eq!(cron["spec"]["schedule"], CRONJOB_SCHEDULE);
        assert_eq!(
            cron.pointer("/spec/jobTemplate/spec/template/spec/restartPolicy"),
            Some(&json!("Never"))
        );

        let template = capability_pod(WorkloadKind::PodTemplate);
        assert!(template.get("spec").is_none());

        let pod = capability_pod(WorkloadKind::Pod);
        assert!(pod["spec"].get("restartPolicy").is_none());
    }

    #[test]
    fn unset_fields_are_omitted() {
        let manifest = WorkloadBuilder::new(WorkloadKind::Pod, "plain")
            .container(ContainerSpec::new("main"))
            .build()
            .unwrap();
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["image"], DEFAULT_TEST_IMAGE);
        assert!(container.get("securityContext").is_none());
        assert!(container.get("resources").is_none());
        assert!(manifest["spec"].get("securityContext").is_none());
        assert!(manifest["spec"].get("initContainers").is_none());
        assert!(manifest["metadata"].get("namespace").is_none());
    }

    #[test]
    fn pod_level_and_container_level_security_are_separate() {
        let manifest = WorkloadBuilder::new(WorkloadKind::Deployment, "precedence")
            .pod_security_context(PodSecurityContextSpec::new().run_as_non_root(true))
            .container(ContainerSpec::new("main").run_as_non_root(false))
            .build()
            .unwrap();
        let spec = &manifest["spec"]["template"]["spec"];
        assert_eq!(spec["securityContext"]["runAsNonRoot"], true);
        assert_eq!(spec["containers"][0]["securityContext"]["runAsNonRoot"], false);
    }

    #[test]
    fn init_containers_resources_and_extra_fields() {
        let manifest = WorkloadBuilder::new(WorkloadKind::CronJob, "limits")
            .namespace("team-a")
            .label("tier", "batch")
            .container(ContainerSpec::new("main").limit("cpu", "100m").limit("memory", "64Mi"))
            .init_container(
                ContainerSpec::new("init")
                    .request("cpu", "50m")
                    .seccomp_profile("RuntimeDefault")
                    .allow_privilege_escalation(false)
                    .run_as_user(1000),
            )
            .pod_spec_field("automountServiceAccountToken", json!(false))
            .build()
            .unwrap();

        assert_eq!(manifest["metadata"]["namespace"], "team-a");
        assert_eq!(manifest["metadata"]["labels"]["tier"], "batch");

        let spec = manifest
            .pointer(WorkloadKind::CronJob.pod_spec_pointer())
            .unwrap();
        assert_eq!(
            spec["containers"][0]["resources"]["limits"],
            json!({"cpu": "100m", "memory": "64Mi"})
        );
        let init = &spec["initContainers"][0];
        assert_eq!(init["resources"]["requests"]["cpu"], "50m");
        assert_eq!(init["securityContext"]["seccompProfile"]["type"], "RuntimeDefault");
        assert_eq!(init["securityContext"]["allowPrivilegeEscalation"], false);
        assert_eq!(init["securityContext"]["runAsUser"], 1000);
        assert_eq!(spec["automountServiceAccountToken"], false);
    }
}
