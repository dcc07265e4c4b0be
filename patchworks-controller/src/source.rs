//! Turns a source reference into template data.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use patchworks_core::{patch::SourceRef, Object, ObjectKey};
use patchworks_store::ObjectStore;
use serde_json::Value;

use crate::{Error, InterruptState, Result};

/// The flat mapping a template is rendered against.
pub type SourceData = BTreeMap<String, String>;

/// Sources live in the core group.
pub const SOURCE_API_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    ConfigMap,
    Secret,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ConfigMap => "ConfigMap",
            SourceKind::Secret => "Secret",
        }
    }

    /// Extracts the data of an object of this kind.
    pub fn extract(&self, object: &Object) -> std::result::Result<SourceData, String> {
        match self {
            SourceKind::ConfigMap => config_map_data(object),
            SourceKind::Secret => secret_data(object),
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ConfigMap" => Ok(SourceKind::ConfigMap),
            "Secret" => Ok(SourceKind::Secret),
            other => Err(Error::UnsupportedSourceKind(other.to_string())),
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn string_map<'a>(
    object: &'a Object,
    field: &str,
) -> std::result::Result<Option<&'a serde_json::Map<String, Value>>, String> {
    match object.as_map().get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(m)) => Ok(Some(m)),
        Some(_) => Err(format!("{} is not a mapping", field)),
    }
}

fn config_map_data(object: &Object) -> std::result::Result<SourceData, String> {
    let mut data = SourceData::new();
    if let Some(m) = string_map(object, "data")? {
        for (k, v) in m {
            match v {
                Value::String(s) => {
                    data.insert(k.clone(), s.clone());
                }
                _ => return Err(format!("data.{} is not a string", k)),
            }
        }
    }
    Ok(data)
}

fn secret_data(object: &Object) -> std::result::Result<SourceData, String> {
    let mut data = SourceData::new();
    if let Some(m) = string_map(object, "data")? {
        for (k, v) in m {
            let encoded = v
                .as_str()
                .ok_or_else(|| format!("data.{} is not a string", k))?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| format!("data.{} is not valid base64: {}", k, e))?;
            data.insert(k.clone(), String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    if let Some(m) = string_map(object, "stringData")? {
        for (k, v) in m {
            let s = v
                .as_str()
                .ok_or_else(|| format!("stringData.{} is not a string", k))?;
            data.insert(k.clone(), s.to_string());
        }
    }
    Ok(data)
}

/// Reads the source named by `source` from `namespace`.
///
/// The source is looked up next to the target. Its current content is read
/// on every call.
pub async fn resolve(
    store: &dyn ObjectStore,
    source: &SourceRef,
    namespace: &str,
    interrupt: &InterruptState,
) -> Result<SourceData> {
    let kind: SourceKind = source.kind.parse()?;
    let key = ObjectKey::new(SOURCE_API_VERSION, kind.as_str(), namespace, &source.name);

    interrupt.check_interrupted()?;
    let object = store.get(&key).await.map_err(|e| {
        if e.is_not_found() {
            Error::SourceNotFound(key.clone())
        } else {
            Error::SourceFetchFailed {
                key: key.clone(),
                source: e,
            }
        }
    })?;

    let data = kind
        .extract(&object)
        .map_err(|reason| Error::SourceDataInvalid { key, reason })?;
    tracing::debug!(source = %kind, name = %source.name, keys = data.len(), "resolved source");
    Ok(data)
}
