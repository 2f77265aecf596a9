//! Manifest materialisation
//!
//! Builders that turn scenario values into submit-ready JSON objects:
//!
//! - [`WorkloadBuilder`] - any of the nine pod-bearing kinds from one
//!   description, with container and pod-level settings threaded to the
//!   kind's pod spec
//! - [`EphemeralContainerPatch`] - strategic-merge body for the
//!   `ephemeralcontainers` subresource
//!
//! Builders never validate. An object the API server rejects on schema
//! grounds shows up as an infrastructure error at probe time, not here.

mod ephemeral;
mod workload;

pub use ephemeral::{EphemeralContainerPatch, EPHEMERAL_SUBRESOURCE};
pub use workload::{ContainerSpec, PodSecurityContextSpec, WorkloadBuilder, WorkloadKind};

use serde_json::{Map, Value};

use crate::Error;

/// Set `new` at the JSON `pointer` inside `target`, creating intermediate
/// objects as needed.
///
/// ```
/// use serde_json::json;
/// use vap_library::manifest::insert_at_pointer;
///
/// let mut obj = json!({"spec": {}});
/// insert_at_pointer(&mut obj, "/spec/template/spec", json!({"containers": []})).unwrap();
/// assert_eq!(obj["spec"]["template"]["spec"]["containers"], json!([]));
/// ```
pub fn insert_at_pointer(target: &mut Value, pointer: &str, new: Value) -> Result<(), Error> {
    if pointer.is_empty() {
        *target = new;
        return Ok(());
    }
    let Some(path) = pointer.strip_prefix('/') else {
        return Err(Error::manifest(format!("invalid JSON pointer {:?}", pointer)));
    };

    let mut current = target;
    let segments: Vec<String> = path.split('/').map(unescape_segment).collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| Error::manifest("empty JSON pointer"))?;

    for segment in parents {
        let object = as_object(current, pointer)?;
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(current, pointer)?.insert(last.clone(), new);
    Ok(())
}

fn as_object<'a>(value: &'a mut Value, pointer: &str) -> Result<&'a mut Map<String, Value>, Error> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .ok_or_else(|| Error::manifest(format!("{} crosses a non-object value", pointer)))
}

fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}
