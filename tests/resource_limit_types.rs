//! Conformance suite for the resource-limit-types policy
//!
//! A namespaced `VAPLibResourceLimitTypesParam` lists the resource types
//! every container must set a limit for. Each feature installs the parameter
//! in its namespace before probing.
//!
//! ```bash
//! cargo test --features e2e --test resource_limit_types
//! ```

mod common;

use std::process::ExitCode;

use futures::FutureExt;
use serde_json::json;

use common::{matrix_features, run_features, run_policy_suite, with_parameter, Case};
use vap_library::manifest::{ContainerSpec, WorkloadBuilder, WorkloadKind};
use vap_library::scenario::Feature;
use vap_library::template::TemplateValues;

const POLICY: &str = "resource-limit-types";

const PARAMETER: &str = r#"
apiVersion: vap-library.com/v1beta1
kind: VAPLibResourceLimitTypesParam
metadata:
  name: resource-limit-types.vap-library.com
  namespace: ${namespace}
spec:
  enforcedResourceLimitTypes:
{% for t in types %}  - ${t}
{% endfor %}"#;

fn all_limits(name: &str) -> ContainerSpec {
    ContainerSpec::new(name)
        .limit("cpu", "500m")
        .limit("memory", "128Mi")
        .limit("ephemeral-storage", "400M")
}

fn missing_ephemeral_storage(name: &str) -> ContainerSpec {
    ContainerSpec::new(name)
        .limit("cpu", "500m")
        .limit("memory", "128Mi")
}

fn cases() -> Vec<Case> {
    vec![
        Case::admit("limits-set", all_limits),
        Case::deny("limits-missing", missing_ephemeral_storage),
    ]
}

fn parameter() -> TemplateValues {
    let mut values = TemplateValues::new();
    values.insert(
        "types".to_string(),
        json!(["cpu", "memory", "ephemeral-storage"]),
    );
    values
}

fn features() -> Result<Vec<Feature>, String> {
    let compliant = WorkloadBuilder::new(WorkloadKind::Pod, "parameter-probe")
        .container(all_limits("app"))
        .build()
        .map_err(|e| e.to_string())?;
    Ok(matrix_features(POLICY, &cases(), all_limits)?
        .into_iter()
        .map(|feature| with_parameter(feature, PARAMETER, parameter(), compliant.clone()))
        .collect())
}

fn main() -> ExitCode {
    run_policy_suite(
        POLICY,
        |config| config.generate_binding(POLICY, true),
        |env| {
            async move { run_features(env, POLICY, features()?).await }.boxed()
        },
    )
}
