//! Conformance suite for the kustomization-fields policy
//!
//! Flux `Kustomization` objects must target the namespace and run as the
//! service account named in the namespaced `VAPLibKustomizationFieldsParam`.
//! Fields the parameter leaves out are not checked. The Kustomization CRD is
//! installed from `crds/flux-kustomize-controller` as an extra resource.
//!
//! ```bash
//! cargo test --features e2e --test kustomization_fields
//! ```

mod common;

use std::path::Path;
use std::process::ExitCode;

use futures::FutureExt;
use serde_json::{json, Value};

use common::{run_features, run_policy_suite, with_parameter};
use vap_library::config::ExtraResources;
use vap_library::scenario::{Feature, Scenario};
use vap_library::template::TemplateValues;

const POLICY: &str = "kustomization-fields";

const TARGET_NAMESPACE: &str = "flux-apps";
const SERVICE_ACCOUNT: &str = "flux-deployer";

const PARAMETER: &str = r#"
apiVersion: vap-library.com/v1beta1
kind: VAPLibKustomizationFieldsParam
metadata:
  name: kustomization-fields.vap-library.com
  namespace: ${namespace}
spec:
{% if target_namespace %}  targetNamespace: ${target_namespace}
{% endif %}{% if service_account %}  serviceAccountName: ${service_account}
{% endif %}"#;

/// A Kustomization with only the fields the CRD requires plus `extra`
fn kustomization(name: &str, extra: Value) -> Value {
    let mut spec = json!({
        "interval": "10m",
        "prune": true,
        "path": "./deploy",
        "sourceRef": {"kind": "OCIRepository", "name": "apps"}
    });
    if let (Some(spec), Some(extra)) = (spec.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            spec.insert(key.clone(), value.clone());
        }
    }
    json!({
        "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
        "kind": "Kustomization",
        "metadata": {"name": name},
        "spec": spec
    })
}

fn full_spec() -> Value {
    json!({"targetNamespace": TARGET_NAMESPACE, "serviceAccountName": SERVICE_ACCOUNT})
}

fn parameter(target_namespace: bool, service_account: bool) -> TemplateValues {
    let mut values = TemplateValues::new();
    let set = |on: bool, value: &str| {
        if on {
            Value::String(value.to_string())
        } else {
            Value::Bool(false)
        }
    };
    values.insert(
        "target_namespace".to_string(),
        set(target_namespace, TARGET_NAMESPACE),
    );
    values.insert(
        "service_account".to_string(),
        set(service_account, SERVICE_ACCOUNT),
    );
    values
}

fn missing_parameter_feature() -> Feature {
    Feature::new(format!("{POLICY}-missing-parameter")).assess(
        Scenario::should_deny("full kustomization", kustomization("full", full_spec()))
            .with_reason("parameterNotFoundAction Deny"),
    )
}

fn full_parameter_feature() -> Feature {
    let feature = Feature::new(format!("{POLICY}-full-parameter"))
        .assess(Scenario::should_admit(
            "matching kustomization",
            kustomization("matching", full_spec()),
        ))
        .assess(
            Scenario::should_deny(
                "no target namespace",
                kustomization("no-target", json!({"serviceAccountName": SERVICE_ACCOUNT})),
            )
            .with_reason("targetNamespace unset"),
        )
        .assess(
            Scenario::should_deny(
                "wrong service account",
                kustomization(
                    "wrong-sa",
                    json!({"targetNamespace": TARGET_NAMESPACE, "serviceAccountName": "default"}),
                ),
            )
            .with_reason("serviceAccountName differs from the parameter"),
        );
    with_parameter(
        feature,
        PARAMETER,
        parameter(true, true),
        kustomization("parameter-probe", full_spec()),
    )
}

/// Only `serviceAccountName` is enforced; any target namespace is accepted
fn partial_parameter_feature() -> Feature {
    let feature = Feature::new(format!("{POLICY}-partial-parameter"))
        .assess(Scenario::should_admit(
            "any target namespace",
            kustomization(
                "other-target",
                json!({"targetNamespace": "elsewhere", "serviceAccountName": SERVICE_ACCOUNT}),
            ),
        ))
        .assess(
            Scenario::should_deny(
                "no service account",
                kustomization("no-sa", json!({"targetNamespace": TARGET_NAMESPACE})),
            )
            .with_reason("serviceAccountName unset"),
        );
    with_parameter(
        feature,
        PARAMETER,
        parameter(false, true),
        kustomization("parameter-probe", json!({"serviceAccountName": SERVICE_ACCOUNT})),
    )
}

fn main() -> ExitCode {
    let crds = Path::new(env!("CARGO_MANIFEST_DIR")).join("crds/flux-kustomize-controller");
    run_policy_suite(
        POLICY,
        |config| {
            config
                .extra_resources(ExtraResources::yaml_files(crds))
                .generate_binding(POLICY, true)
        },
        |env| {
            async move {
                run_features(
                    env,
                    POLICY,
                    vec![
                        missing_parameter_feature(),
                        full_parameter_feature(),
                        partial_parameter_feature(),
                    ],
                )
                .await
            }
            .boxed()
        },
    )
}
