//! YAML loading via yaml-rust2
//!
//! Policy bundles and templated manifests are authored in YAML but handled as
//! `serde_json::Value` everywhere else, so this module converts documents on
//! the way in. Empty documents (a trailing `---`, comment-only files) are
//! dropped rather than surfacing as `null` manifests.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

/// Error type for YAML parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for YamlError {}

/// Parse the first document of `input`. Empty input yields `Value::Null`.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    docs.into_iter()
        .next()
        .map(to_json)
        .unwrap_or(Ok(Value::Null))
}

/// Parse every non-empty document of a `---` separated stream.
pub fn parse_documents(input: &str) -> Result<Vec<Value>, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match to_json(doc)? {
            Value::Null => {}
            value => out.push(value),
        }
    }
    Ok(out)
}

fn to_json(yaml: Yaml) -> Result<Value, YamlError> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(raw) => {
            let f: f64 = raw
                .parse()
                .map_err(|_| YamlError(format!("invalid float: {raw}")))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = Map::with_capacity(hash.len());
            for (k, v) in hash {
                map.insert(key_string(k)?, to_json(v)?);
            }
            Value::Object(map)
        }
        // The loader resolves aliases in place; one that survives is dangling
        Yaml::Alias(_) => return Err(YamlError("unresolved YAML alias".to_string())),
        Yaml::BadValue => return Err(YamlError("bad YAML value".to_string())),
    })
}

fn key_string(key: Yaml) -> Result<String, YamlError> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(YamlError("unsupported YAML key type".to_string())),
    }
}
