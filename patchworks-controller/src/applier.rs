//! Writing rendered patches to targets, and taking them back.

use std::fmt::Display;

use patchworks_core::{
    patch::{
        annotations::{self, PATCHED_BY_VALUE},
        TargetRef,
    },
    CoreError, Object, ObjectKey,
};
use patchworks_store::ObjectStore;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{snapshot, Error, InterruptState, Result};

/// The result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub patch_id: String,
    /// The target's version after the write
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reverted {
    /// The target does not exist; there is nothing to clean up.
    TargetMissing,
    /// The target carries none of our annotations. Nothing was written.
    Unchanged,
    /// The snapshot was written back.
    Restored,
    /// There was no usable snapshot, so only our annotations were removed.
    Cleaned,
}

impl Display for Reverted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reverted::TargetMissing => "target missing",
            Reverted::Unchanged => "nothing to revert",
            Reverted::Restored => "restored original state",
            Reverted::Cleaned => "removed provenance annotations",
        };
        write!(f, "{}", s)
    }
}

/// Parses rendered template output into a merge document.
///
/// The output is YAML (and therefore also JSON) and must be a mapping.
pub fn parse_payload(rendered: &str) -> Result<Value> {
    let value: Value =
        serde_yaml::from_str(rendered).map_err(|e| Error::PatchPayloadInvalid(e.to_string()))?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Err(Error::PatchPayloadInvalid("document is empty".to_string())),
        _ => Err(Error::PatchPayloadInvalid(
            "document is not a mapping".to_string(),
        )),
    }
}

fn object_field<'a>(map: &'a mut Map<String, Value>, field: &str) -> Result<&'a mut Map<String, Value>> {
    let entry = map
        .entry(field)
        .or_insert_with(|| Value::Object(Map::new()));
    match entry {
        Value::Object(m) => Ok(m),
        _ => Err(Error::PatchPayloadInvalid(format!(
            "{} is not a mapping",
            field
        ))),
    }
}

/// Adds our annotations and the optimistic concurrency precondition to the
/// payload's metadata.
fn tag_payload(
    payload: &mut Value,
    patch_id: &str,
    snapshot: &str,
    resource_version: Option<&str>,
) -> Result<()> {
    let Value::Object(root) = payload else {
        return Err(Error::PatchPayloadInvalid(
            "document is not a mapping".to_string(),
        ));
    };
    let metadata = object_field(root, "metadata")?;
    match resource_version {
        Some(v) => {
            metadata.insert("resourceVersion".to_string(), Value::from(v));
        }
        None => {
            metadata.remove("resourceVersion");
        }
    }
    let a = object_field(metadata, "annotations")?;
    a.insert(annotations::PATCHED_BY.to_string(), Value::from(PATCHED_BY_VALUE));
    a.insert(annotations::PATCH_ID.to_string(), Value::from(patch_id));
    a.insert(annotations::ORIGINAL_STATE.to_string(), Value::from(snapshot));
    Ok(())
}

fn invalid_target(target: &ObjectKey) -> impl FnOnce(CoreError) -> Error + '_ {
    move |source| Error::InvalidApiVersion {
        target: target.clone(),
        source,
    }
}

async fn fetch_target(
    store: &dyn ObjectStore,
    target: &ObjectKey,
    interrupt: &InterruptState,
) -> Result<Option<Object>> {
    target.group_version().map_err(invalid_target(target))?;
    interrupt.check_interrupted()?;
    match store.get(target).await {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(Error::TargetFetchFailed {
            target: target.clone(),
            source: e,
        }),
    }
}

/// Merges `rendered` into the target and tags it with provenance.
///
/// The snapshot of the first apply is kept across re-applies, so it always
/// holds the state from before any of our patches.
pub async fn apply(
    store: &dyn ObjectStore,
    target: &TargetRef,
    rendered: &str,
    interrupt: &InterruptState,
) -> Result<Applied> {
    let mut payload = parse_payload(rendered)?;
    let key = target.key();

    let current = fetch_target(store, &key, interrupt)
        .await?
        .ok_or_else(|| Error::TargetFetchFailed {
            target: key.clone(),
            source: patchworks_store::StoreError::NotFound(key.clone()),
        })?;

    let (patch_id, snapshot) = match snapshot::provenance(&current) {
        Some(p) => {
            debug!(object = %key, patch_id = %p.patch_id, "target already patched, keeping snapshot");
            (p.patch_id, p.snapshot)
        }
        None => (uuid::Uuid::new_v4().to_string(), snapshot::capture(&current)),
    };
    tag_payload(
        &mut payload,
        &patch_id,
        &snapshot,
        current.resource_version(),
    )?;

    interrupt.check_interrupted()?;
    let patched = store
        .patch(&key, &payload)
        .await
        .map_err(|e| Error::PatchApplyFailed {
            target: key.clone(),
            source: e,
        })?;

    Ok(Applied {
        patch_id,
        resource_version: patched.resource_version().map(str::to_string),
    })
}

/// Puts the target back the way it was before the first apply.
///
/// Our annotations are always removed, whether or not the snapshot can be
/// restored.
pub async fn revert(
    store: &dyn ObjectStore,
    target: &TargetRef,
    interrupt: &InterruptState,
) -> Result<Reverted> {
    let key = target.key();
    let Some(current) = fetch_target(store, &key, interrupt).await? else {
        return Ok(Reverted::TargetMissing);
    };
    if !snapshot::has_provenance(&current) {
        return Ok(Reverted::Unchanged);
    }

    // Identity is version-independent, like the store's addressing.
    let id = key.storage_id().map_err(invalid_target(&key))?;
    let restored = current
        .annotation(annotations::ORIGINAL_STATE)
        .and_then(|encoded| match snapshot::restore(encoded) {
            Ok(o) if o.key().and_then(|k| k.storage_id()).ok().as_ref() == Some(&id) => Some(o),
            Ok(_) => {
                warn!(object = %key, "snapshot describes a different object, ignoring it");
                None
            }
            Err(e) => {
                warn!(object = %key, error = %e, "cannot decode snapshot, ignoring it");
                None
            }
        });

    let (mut object, outcome) = match restored {
        Some(mut o) => {
            // Finalizers belong to whoever manages the target's deletion.
            let finalizers = current.as_map().get("metadata").and_then(|m| m.get("finalizers"));
            match finalizers {
                Some(f) => {
                    o.metadata_mut().insert("finalizers".to_string(), f.clone());
                }
                None => {
                    o.metadata_mut().remove("finalizers");
                }
            }
            (o, Reverted::Restored)
        }
        None => (current.clone(), Reverted::Cleaned),
    };
    snapshot::strip_provenance(&mut object);
    object.set_resource_version(current.resource_version());

    interrupt.check_interrupted()?;
    store
        .update(object)
        .await
        .map_err(|e| Error::RevertFailed {
            target: key.clone(),
            source: e,
        })?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use patchworks_store::{MemoryStore, ObjectStore as _};
    use serde_json::json;

    fn target() -> TargetRef {
        TargetRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: "web".to_string(),
            name: "nginx".to_string(),
        }
    }

    /// The object without the fields every write changes.
    fn comparable(mut o: Object) -> Object {
        o.set_resource_version(None);
        o
    }

    async fn get_target(store: &MemoryStore) -> Object {
        store.get(&target().key()).await.unwrap()
    }

    const IMAGE_PATCH: &str =
        "spec:\n  template:\n    spec:\n      containers:\n        - name: nginx\n          image: nginx:2.0\n";

    #[test]
    fn payload_must_be_a_mapping() {
        assert_eq!(parse_payload("a: 1").unwrap(), json!({ "a": 1 }));
        assert_eq!(parse_payload("{\"a\": 1}").unwrap(), json!({ "a": 1 }));
        assert!(matches!(parse_payload(""), Err(Error::PatchPayloadInvalid(_))));
        assert!(matches!(parse_payload("- a"), Err(Error::PatchPayloadInvalid(_))));
        assert!(matches!(parse_payload("just text"), Err(Error::PatchPayloadInvalid(_))));
        assert!(matches!(parse_payload("a: [1"), Err(Error::PatchPayloadInvalid(_))));
    }

    #[test]
    fn non_mapping_metadata_is_invalid() {
        let mut payload = json!({ "metadata": "x" });
        assert!(matches!(
            tag_payload(&mut payload, "id", "{}", None),
            Err(Error::PatchPayloadInvalid(_))
        ));
        let mut payload = json!({ "metadata": { "annotations": [] } });
        assert!(matches!(
            tag_payload(&mut payload, "id", "{}", None),
            Err(Error::PatchPayloadInvalid(_))
        ));
    }

    #[tokio::test]
    async fn apply_merges_and_tags() {
        let store = test_support::store_with_target().await;
        let before = get_target(&store).await;

        let applied = apply(&store, &target(), "spec:\n  replicas: 3\n", &InterruptState::new())
            .await
            .unwrap();

        let after = get_target(&store).await;
        assert_eq!(after.as_map()["spec"]["replicas"], json!(3));
        // untouched fields survive the merge
        assert_eq!(
            after.as_map()["spec"]["template"],
            before.as_map()["spec"]["template"]
        );
        assert_eq!(after.annotation("owner"), Some("team-a"));
        assert_eq!(
            after.annotation(annotations::PATCHED_BY),
            Some(PATCHED_BY_VALUE)
        );
        assert_eq!(
            after.annotation(annotations::PATCH_ID),
            Some(applied.patch_id.as_str())
        );
        assert!(!applied.patch_id.is_empty());
        assert_eq!(applied.resource_version.as_deref(), after.resource_version());

        let snap = snapshot::restore(after.annotation(annotations::ORIGINAL_STATE).unwrap()).unwrap();
        assert_eq!(snap, comparable(before));
    }

    #[tokio::test]
    async fn reapply_is_idempotent() {
        let store = test_support::store_with_target().await;
        let first = apply(&store, &target(), IMAGE_PATCH, &InterruptState::new())
            .await
            .unwrap();
        let once = get_target(&store).await;
        let second = apply(&store, &target(), IMAGE_PATCH, &InterruptState::new())
            .await
            .unwrap();
        let twice = get_target(&store).await;
        assert_eq!(first.patch_id, second.patch_id);
        assert_eq!(comparable(once), comparable(twice));
    }

    #[tokio::test]
    async fn changed_patch_keeps_the_first_snapshot() {
        let store = test_support::store_with_target().await;
        let original = get_target(&store).await;
        apply(&store, &target(), "spec:\n  replicas: 2\n", &InterruptState::new())
            .await
            .unwrap();
        apply(&store, &target(), "spec:\n  replicas: 5\n", &InterruptState::new())
            .await
            .unwrap();

        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::Restored
        );
        assert_eq!(comparable(get_target(&store).await), comparable(original));
    }

    #[tokio::test]
    async fn apply_then_revert_round_trips() {
        let store = test_support::store_with_target().await;
        let original = get_target(&store).await;
        apply(
            &store,
            &target(),
            "metadata:\n  labels:\n    tier: frontend\n  annotations:\n    owner: null\nspec:\n  paused: true\n",
            &InterruptState::new(),
        )
        .await
        .unwrap();
        let patched = get_target(&store).await;
        assert_eq!(patched.annotation("owner"), None);

        let outcome = revert(&store, &target(), &InterruptState::new()).await.unwrap();
        assert_eq!(outcome, Reverted::Restored);
        let reverted = get_target(&store).await;
        assert_eq!(comparable(reverted.clone()), comparable(original));
        assert!(!snapshot::has_provenance(&reverted));
    }

    #[tokio::test]
    async fn revert_through_another_version_restores() {
        let store = test_support::store_with_target().await;
        let original = get_target(&store).await;
        let mut skewed = target();
        skewed.api_version = "apps/v1beta1".to_string();

        apply(&store, &skewed, "spec:\n  replicas: 9\n", &InterruptState::new())
            .await
            .unwrap();
        assert_eq!(get_target(&store).await.as_map()["spec"]["replicas"], json!(9));

        let outcome = revert(&store, &skewed, &InterruptState::new()).await.unwrap();
        assert_eq!(outcome, Reverted::Restored);
        let reverted = get_target(&store).await;
        assert_eq!(reverted.as_map()["spec"]["replicas"], json!(1));
        assert_eq!(comparable(reverted), comparable(original));
    }

    #[tokio::test]
    async fn apply_to_missing_target_fails() {
        let store = MemoryStore::new();
        let err = apply(&store, &target(), "a: 1", &InterruptState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetFetchFailed { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_the_store() {
        let store = test_support::store_with_target().await;
        let before = get_target(&store).await;
        let err = apply(&store, &target(), "- not a mapping", &InterruptState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatchPayloadInvalid(_)));
        assert_eq!(get_target(&store).await, before);
    }

    #[tokio::test]
    async fn invalid_api_version() {
        let store = test_support::store_with_target().await;
        let mut t = target();
        t.api_version = "apps/".to_string();
        let err = apply(&store, &t, "a: 1", &InterruptState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidApiVersion { .. }));
        assert_eq!(
            err.to_string(),
            "invalid target reference Deployment web/nginx"
        );
    }

    #[tokio::test]
    async fn revert_without_provenance_writes_nothing() {
        let store = test_support::store_with_target().await;
        let before = get_target(&store).await;
        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::Unchanged
        );
        assert_eq!(get_target(&store).await, before);
    }

    #[tokio::test]
    async fn revert_of_missing_target_succeeds() {
        let store = MemoryStore::new();
        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::TargetMissing
        );
    }

    #[tokio::test]
    async fn revert_clears_stray_annotations() {
        let store = test_support::store_with_target().await;
        let key = target().key();
        store
            .patch(
                &key,
                &json!({ "metadata": { "annotations": { (annotations::PATCH_ID): "stray" } } }),
            )
            .await
            .unwrap();
        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::Cleaned
        );
        let after = get_target(&store).await;
        assert!(!snapshot::has_provenance(&after));
        assert_eq!(after.annotation("owner"), Some("team-a"));
    }

    #[tokio::test]
    async fn revert_with_corrupt_snapshot_cleans() {
        let store = test_support::store_with_target().await;
        apply(&store, &target(), "spec:\n  replicas: 4\n", &InterruptState::new())
            .await
            .unwrap();
        store
            .patch(
                &target().key(),
                &json!({ "metadata": { "annotations": { (annotations::ORIGINAL_STATE): "{broken" } } }),
            )
            .await
            .unwrap();
        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::Cleaned
        );
        let after = get_target(&store).await;
        assert!(!snapshot::has_provenance(&after));
        // the patched content stays, there is nothing to restore it from
        assert_eq!(after.as_map()["spec"]["replicas"], json!(4));
    }

    #[tokio::test]
    async fn revert_ignores_snapshot_of_another_object() {
        let store = test_support::store_with_target().await;
        let other = Object::new("apps/v1", "Deployment", "web", "other");
        store
            .patch(
                &target().key(),
                &json!({ "metadata": { "annotations": {
                    (annotations::PATCHED_BY): PATCHED_BY_VALUE,
                    (annotations::PATCH_ID): "x",
                    (annotations::ORIGINAL_STATE): snapshot::capture(&other),
                } } }),
            )
            .await
            .unwrap();
        assert_eq!(
            revert(&store, &target(), &InterruptState::new()).await.unwrap(),
            Reverted::Cleaned
        );
    }

    #[tokio::test]
    async fn revert_keeps_current_finalizers() {
        let store = test_support::store_with_target().await;
        apply(&store, &target(), "spec:\n  replicas: 4\n", &InterruptState::new())
            .await
            .unwrap();
        store
            .patch(
                &target().key(),
                &json!({ "metadata": { "finalizers": ["example.com/protect"] } }),
            )
            .await
            .unwrap();
        revert(&store, &target(), &InterruptState::new()).await.unwrap();
        let after = get_target(&store).await;
        assert_eq!(after.finalizers(), vec!["example.com/protect".to_string()]);
        assert_eq!(after.as_map()["spec"]["replicas"], json!(1));
    }

    #[tokio::test]
    async fn cancelled_apply_writes_nothing() {
        let store = test_support::store_with_target().await;
        let before = get_target(&store).await;
        let interrupt = InterruptState::new();
        interrupt.set_interrupted();
        let err = apply(&store, &target(), "a: 1", &interrupt).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(get_target(&store).await, before);
    }
}
