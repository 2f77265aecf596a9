//! Helpers shared by the conformance suites
//!
//! Every suite is its own binary with its own kind cluster. Suites build
//! their features up front, then run them one after another and print the
//! summary banner.

#![allow(dead_code)]

use std::process::ExitCode;

use futures::future::BoxFuture;
use serde_json::Value;

use vap_library::config::EnvConfig;
use vap_library::env::{run_suite, TestEnvironment};
use vap_library::manifest::{
    ContainerSpec, EphemeralContainerPatch, PodSecurityContextSpec, WorkloadBuilder, WorkloadKind,
    EPHEMERAL_SUBRESOURCE,
};
use vap_library::probe::ObjectTarget;
use vap_library::scenario::{Feature, Scenario, Submission, TestHarness};
use vap_library::template::TemplateValues;

/// Pod the ephemeral container features patch
pub const EPHEMERAL_TARGET: &str = "ephemeral-target";

/// Provision the environment for `policy` and run `suite` in it
pub fn run_policy_suite<C, F>(policy: &str, configure: C, suite: F) -> ExitCode
where
    C: FnOnce(EnvConfig) -> EnvConfig,
    F: for<'a> FnOnce(&'a TestEnvironment) -> BoxFuture<'a, Result<(), String>>,
{
    let config = match EnvConfig::from_env(policy) {
        Ok(config) => configure(config),
        Err(e) => {
            eprintln!("invalid configuration for {policy}: {e}");
            return ExitCode::FAILURE;
        }
    };
    run_suite(config, suite)
}

/// Test `features` in order and print the summary
pub async fn run_features(
    env: &TestEnvironment,
    suite: &str,
    features: Vec<Feature>,
) -> Result<(), String> {
    let mut harness = TestHarness::new(suite);
    for feature in features {
        harness.record(feature.test(env).await);
    }
    harness.finish()
}

// =============================================================================
// Workload matrices
// =============================================================================

/// Where the container under test sits in the pod spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// `containers[0]`
    Container,
    /// `initContainers[0]`, next to a compliant regular container
    InitContainer,
}

impl Placement {
    pub const ALL: [Placement; 2] = [Placement::Container, Placement::InitContainer];

    pub fn slug(self) -> &'static str {
        match self {
            Placement::Container => "container",
            Placement::InitContainer => "init",
        }
    }
}

/// One row of a policy matrix: the container under test (and optionally
/// the pod security context) plus whether admission should accept it
pub struct Case {
    pub name: &'static str,
    pub admitted: bool,
    pub container: fn(&str) -> ContainerSpec,
    pub pod_security: Option<fn() -> PodSecurityContextSpec>,
}

impl Case {
    pub fn admit(name: &'static str, container: fn(&str) -> ContainerSpec) -> Self {
        Self {
            name,
            admitted: true,
            container,
            pod_security: None,
        }
    }

    pub fn deny(name: &'static str, container: fn(&str) -> ContainerSpec) -> Self {
        Self {
            name,
            admitted: false,
            container,
            pod_security: None,
        }
    }

    pub fn with_pod(mut self, pod_security: fn() -> PodSecurityContextSpec) -> Self {
        self.pod_security = Some(pod_security);
        self
    }
}

/// Build one workload for `case`; `compliant` fills the regular container
/// slot when the case targets the init container
pub fn workload(
    kind: WorkloadKind,
    placement: Placement,
    case: &Case,
    compliant: fn(&str) -> ContainerSpec,
) -> Result<Value, String> {
    let name = format!("{}-{}-{}", kind.slug(), placement.slug(), case.name);
    let mut builder = WorkloadBuilder::new(kind, &name);
    builder = match placement {
        Placement::Container => builder.container((case.container)("app")),
        Placement::InitContainer => builder
            .container(compliant("app"))
            .init_container((case.container)("init")),
    };
    if let Some(pod) = case.pod_security {
        builder = builder.pod_security_context(pod());
    }
    builder
        .build()
        .map_err(|e| format!("failed to build {name}: {e}"))
}

/// One feature per workload kind covering every case in both placements
pub fn matrix_features(
    policy: &str,
    cases: &[Case],
    compliant: fn(&str) -> ContainerSpec,
) -> Result<Vec<Feature>, String> {
    let mut features = Vec::new();
    for kind in WorkloadKind::ALL {
        let mut feature = Feature::new(format!("{policy}-{}", kind.slug()));
        for placement in Placement::ALL {
            for case in cases {
                let manifest = workload(kind, placement, case, compliant)?;
                let name = format!("{kind} {} {}", placement.slug(), case.name);
                feature = feature.assess(if case.admitted {
                    Scenario::should_admit(name, manifest)
                } else {
                    Scenario::should_deny(name, manifest)
                });
            }
        }
        features.push(feature);
    }
    Ok(features)
}

// =============================================================================
// Ephemeral containers
// =============================================================================

/// One feature that creates a compliant pod and adds an ephemeral container
/// per case through the `ephemeralcontainers` subresource. Pod-level
/// security contexts of the cases are ignored: a running pod's cannot change.
pub fn ephemeral_feature(
    policy: &str,
    cases: &[Case],
    compliant: fn(&str) -> ContainerSpec,
) -> Result<Feature, String> {
    let pod = WorkloadBuilder::new(WorkloadKind::Pod, EPHEMERAL_TARGET)
        .container(compliant("app"))
        .build()
        .map_err(|e| e.to_string())?;

    let mut feature = Feature::new(format!("{policy}-ephemeral")).setup(
        "create target pod",
        move |ctx| {
            let pod = pod.clone();
            async move {
                ctx.create(&pod).await?;
                ctx.wait_for_object(&ObjectTarget::pod(EPHEMERAL_TARGET)).await
            }
        },
    );

    for case in cases.iter().filter(|c| c.pod_security.is_none()) {
        let container = (case.container)(&format!("ephemeral-{}", case.name));
        let patch = EphemeralContainerPatch::new(container)
            .target_container("app")
            .build()
            .map_err(|e| e.to_string())?;
        let submission = Submission::patch_subresource(
            ObjectTarget::pod(EPHEMERAL_TARGET),
            EPHEMERAL_SUBRESOURCE,
            patch,
        );
        let name = format!("ephemeral {}", case.name);
        feature = feature.assess(if case.admitted {
            Scenario::should_admit(name, submission)
        } else {
            Scenario::should_deny(name, submission)
        });
    }
    Ok(feature)
}

// =============================================================================
// Parameters
// =============================================================================

/// Add a setup step that installs the policy parameter rendered from
/// `template` and waits until admission uses it. Parameter objects reach the
/// admission plugin through its own informer, so readiness is observed by
/// creating `compliant` until it is admitted.
pub fn with_parameter(
    feature: Feature,
    template: &'static str,
    values: TemplateValues,
    compliant: Value,
) -> Feature {
    feature.setup("install parameter", move |ctx| {
        let values = values.clone();
        let compliant = compliant.clone();
        async move {
            let parameter = ctx.render(template, &values)?;
            ctx.apply(&parameter).await?;
            ctx.wait_until_admitted(&compliant).await
        }
    })
}
