//! The pre-patch state of a target, kept in one of its own annotations.
//!
//! The snapshot is a JSON document of the whole target as it was before the
//! first apply, minus the bookkeeping that changes on every write
//! (`resourceVersion`) and minus our own annotations.

use patchworks_core::{
    patch::annotations::{self, ALL, PATCHED_BY_VALUE},
    CoreError, Object,
};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("snapshot is not an object")]
    NotAnObject(#[from] CoreError),
}

/// The provenance our apply leaves on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub patch_id: String,
    pub snapshot: String,
}

/// Encodes `object` as a snapshot.
pub fn capture(object: &Object) -> String {
    let mut object = object.clone();
    strip_provenance(&mut object);
    object.set_resource_version(None);
    // A map of JSON values always serializes
    serde_json::to_string(&object).unwrap_or_default()
}

pub fn restore(encoded: &str) -> Result<Object, SnapshotError> {
    let value: serde_json::Value = serde_json::from_str(encoded)?;
    Ok(Object::from_value(value)?)
}

/// Removes our annotations. Returns whether any were present.
pub fn strip_provenance(object: &mut Object) -> bool {
    object.remove_annotations(&ALL)
}

/// Whether `object` has any of our annotations, including partial leftovers.
pub fn has_provenance(object: &Object) -> bool {
    ALL.iter().any(|k| object.annotation(k).is_some())
}

/// The provenance of a complete, earlier apply, if any.
pub fn provenance(object: &Object) -> Option<Provenance> {
    if object.annotation(annotations::PATCHED_BY) != Some(PATCHED_BY_VALUE) {
        return None;
    }
    let snapshot = object.annotation(annotations::ORIGINAL_STATE)?;
    let patch_id = object.annotation(annotations::PATCH_ID).unwrap_or_default();
    if patch_id.is_empty() {
        return None;
    }
    Some(Provenance {
        patch_id: patch_id.to_string(),
        snapshot: snapshot.to_string(),
    })
}
