use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, ObjectKey, Result};

/// An addressable document with no schema beyond the usual metadata.
///
/// All fields other than the ones exposed by accessors are passed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Map<String, Value>);

impl Object {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Object {
        let mut o = Object::default();
        o.0.insert("apiVersion".to_string(), Value::from(api_version));
        o.0.insert("kind".to_string(), Value::from(kind));
        let meta = o.metadata_mut();
        meta.insert("name".to_string(), Value::from(name));
        if !namespace.is_empty() {
            meta.insert("namespace".to_string(), Value::from(namespace));
        }
        o
    }

    pub fn from_value(value: Value) -> Result<Object> {
        match value {
            Value::Object(map) => Ok(Object(map)),
            Value::Null => Err(CoreError::NotAnObject("null")),
            Value::Bool(_) => Err(CoreError::NotAnObject("a boolean")),
            Value::Number(_) => Err(CoreError::NotAnObject("a number")),
            Value::String(_) => Err(CoreError::NotAnObject("a string")),
            Value::Array(_) => Err(CoreError::NotAnObject("an array")),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    fn str_field(&self, field: &'static str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata").and_then(Value::as_object)
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
    }

    /// The `metadata` mapping, created if absent or not a mapping.
    pub fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(m) => m,
            _ => unreachable!("metadata was just set to an object"),
        }
    }

    pub fn api_version(&self) -> Option<&str> {
        self.str_field("apiVersion")
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_field("kind")
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    /// The namespace, or the empty string for cluster scoped objects.
    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace").unwrap_or("")
    }

    pub fn key(&self) -> Result<ObjectKey> {
        Ok(ObjectKey {
            api_version: self
                .api_version()
                .ok_or(CoreError::MissingField("apiVersion"))?
                .to_string(),
            kind: self
                .kind()
                .ok_or(CoreError::MissingField("kind"))?
                .to_string(),
            namespace: self.namespace().to_string(),
            name: self
                .name()
                .ok_or(CoreError::MissingField("metadata.name"))?
                .to_string(),
        })
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    pub fn set_resource_version(&mut self, version: Option<&str>) {
        match version {
            Some(v) => {
                self.metadata_mut()
                    .insert("resourceVersion".to_string(), Value::from(v));
            }
            None => {
                self.metadata_mut().remove("resourceVersion");
            }
        }
    }

    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.metadata_str("deletionTimestamp")
    }

    pub fn set_deletion_timestamp(&mut self, time: &str) {
        self.metadata_mut()
            .insert("deletionTimestamp".to_string(), Value::from(time));
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.metadata()
            .and_then(|m| m.get("finalizers"))
            .and_then(Value::as_array)
            .map(|fs| {
                fs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata()
            .and_then(|m| m.get("annotations"))
            .and_then(Value::as_object)
            .map(|a| {
                a.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    /// Replaces all annotations. An empty map removes the field.
    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        let meta = self.metadata_mut();
        if annotations.is_empty() {
            meta.remove("annotations");
        } else {
            meta.insert(
                "annotations".to_string(),
                Value::Object(
                    annotations
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect(),
                ),
            );
        }
    }

    /// Removes the given annotations, dropping the field if it becomes empty.
    /// Returns whether anything was removed.
    pub fn remove_annotations(&mut self, keys: &[&str]) -> bool {
        let mut annotations = self.annotations();
        let before = annotations.len();
        for key in keys {
            annotations.remove(*key);
        }
        if annotations.len() == before {
            return false;
        }
        self.set_annotations(annotations);
        true
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Value {
        o.into_value()
    }
}
