//! The `Patch` resource: a template, a data source and one target object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, NamespacedName, Object, ObjectKey, Result};

pub const API_VERSION: &str = "patchworks.dev/v1";
pub const KIND: &str = "Patch";

/// Held on a `Patch` while its changes may still be present on the target.
pub const FINALIZER: &str = "patchworks.dev/finalizer";

/// Provenance annotations written to the target on apply and removed on revert.
pub mod annotations {
    pub const PATCHED_BY: &str = "patchworks.dev/patched-by";
    pub const PATCH_ID: &str = "patchworks.dev/patch-id";
    pub const ORIGINAL_STATE: &str = "patchworks.dev/original-state";

    /// Value of [`PATCHED_BY`].
    pub const PATCHED_BY_VALUE: &str = "patch-operator";

    pub const ALL: [&str; 3] = [PATCHED_BY, PATCH_ID, ORIGINAL_STATE];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub api_version: String,
    pub kind: String,
    pub metadata: PatchMetadata,
    pub spec: PatchSpec,
    /// Anything else on the object, e.g. a status written by other tools.
    #[serde(flatten)]
    pub other_fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(flatten)]
    pub other_fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    pub source: SourceRef,
    pub target: TargetRef,
    pub template: String,
}

/// Names the object that supplies template data. It is looked up in the
/// namespace of the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

impl Patch {
    pub fn key_for(name: &NamespacedName) -> ObjectKey {
        ObjectKey::new(API_VERSION, KIND, name.namespace.clone(), name.name.clone())
    }

    pub fn from_object(object: Object) -> Result<Patch> {
        serde_json::from_value(object.into_value())
            .map_err(|e| CoreError::InvalidPatch(e.to_string()))
    }

    pub fn to_object(&self) -> Object {
        let value = serde_json::to_value(self).expect("Patch serializes to a JSON object");
        Object::from_value(value).expect("Patch serializes to a JSON object")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.metadata.namespace.clone(),
            self.metadata.name.clone(),
        )
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Returns whether the finalizer was added.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            false
        } else {
            self.metadata.finalizers.push(FINALIZER.to_string());
            true
        }
    }

    /// Returns whether the finalizer was removed.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != FINALIZER);
        before != self.metadata.finalizers.len()
    }
}
