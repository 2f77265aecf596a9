//! Ephemeral container patches
//!
//! Ephemeral containers can only be added through the `ephemeralcontainers`
//! subresource of an existing pod, so policies covering them are exercised
//! with a strategic-merge patch rather than a create.

use serde_json::{json, Value};

use super::ContainerSpec;
use crate::Error;

/// Subresource the patch is sent to
pub const EPHEMERAL_SUBRESOURCE: &str = "ephemeralcontainers";

/// Strategic-merge patch adding one ephemeral container to a pod
#[derive(Clone, Debug)]
pub struct EphemeralContainerPatch {
    container: ContainerSpec,
    target_container: Option<String>,
}

impl EphemeralContainerPatch {
    /// Patch adding `container` (its security context and image are kept)
    pub fn new(container: ContainerSpec) -> Self {
        Self {
            container,
            target_container: None,
        }
    }

    /// Share the process namespace of `container` in the target pod
    pub fn target_container(mut self, container: impl Into<String>) -> Self {
        self.target_container = Some(container.into());
        self
    }

    /// Render the patch body
    ///
    /// The shape matches what `kubectl debug` sends: interactive stdin/tty,
    /// file termination messages and an explicit empty resources block.
    pub fn build(&self) -> Result<Value, Error> {
        let mut container = serde_json::to_value(self.container.as_container())
            .map_err(|e| Error::manifest(format!("serialize failed: {}", e)))?;

        container["stdin"] = json!(true);
        container["tty"] = json!(true);
        container["terminationMessagePolicy"] = json!("File");
        if container.get("resources").is_none() {
            container["resources"] = json!({});
        }
        if let Some(target) = &self.target_container {
            container["targetContainerName"] = json!(target);
        }

        Ok(json!({ "spec": { "ephemeralContainers": [container] } }))
    }
}
