use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use patchworks_core::{GroupVersion, Object, ObjectKey};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::{ObjectStore, Result, StoreError, WatchEvent};

/// Marks the exported state document; see [`MemoryStore::export`].
pub const STATE_TYPE: &str = "patchworksStore";

const WATCH_CAPACITY: usize = 1024;

/// An object store held in process memory.
///
/// `resourceVersion`s come from a single counter shared by all objects.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

struct Inner {
    objects: BTreeMap<String, Object>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_objects(BTreeMap::new(), 0)
    }

    fn with_objects(objects: BTreeMap<String, Object>, last_version: u64) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        MemoryStore {
            inner: Mutex::new(Inner {
                objects,
                last_version,
            }),
            events,
        }
    }

    /// Rebuilds a store from a document produced by [`MemoryStore::export`].
    pub fn from_state(state: &Value) -> Result<MemoryStore> {
        let (objects, last_version) = parse_state(state)?;
        Ok(Self::with_objects(objects, last_version))
    }

    /// Replaces the whole content with `state`, telling watchers about every
    /// object that changed.
    pub async fn reload(&self, state: &Value) -> Result<()> {
        let (objects, last_version) = parse_state(state)?;
        let mut inner = self.inner.lock().await;
        let mut events = Vec::new();
        for (id, old) in &inner.objects {
            if !objects.contains_key(id) {
                events.push(WatchEvent::Deleted(old.clone()));
            }
        }
        for (id, new) in &objects {
            match inner.objects.get(id) {
                None => events.push(WatchEvent::Added(new.clone())),
                Some(old) if old != new => events.push(WatchEvent::Modified(new.clone())),
                Some(_) => {}
            }
        }
        inner.objects = objects;
        inner.last_version = last_version;
        drop(inner);
        for event in events {
            self.publish(event);
        }
        Ok(())
    }

    /// The whole store content as one JSON document.
    pub async fn export(&self) -> Value {
        let inner = self.inner.lock().await;
        json!({
            "_type": STATE_TYPE,
            "lastVersion": inner.last_version,
            "objects": inner.objects,
        })
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

fn parse_state(state: &Value) -> Result<(BTreeMap<String, Object>, u64)> {
    if state.get("_type").and_then(Value::as_str) != Some(STATE_TYPE) {
        return Err(StoreError::Invalid(format!(
            "unexpected _type in store state: expected '{}'",
            STATE_TYPE
        )));
    }
    let entries = state
        .get("objects")
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::Invalid("store state has no objects".to_string()))?;
    // Versions of deleted objects are only remembered in lastVersion.
    let mut last_version = state.get("lastVersion").and_then(Value::as_u64).unwrap_or(0);
    let mut objects = BTreeMap::new();
    for (id, value) in entries {
        let object = Object::from_value(value.clone())?;
        if let Some(v) = object.resource_version().and_then(|v| v.parse::<u64>().ok()) {
            last_version = last_version.max(v);
        }
        objects.insert(id.clone(), object);
    }
    Ok((objects, last_version))
}

fn resource_version_precondition(patch: &Value) -> Option<&str> {
    patch
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str)
}

fn check_version(key: &ObjectKey, stored: &Object, expected: Option<&str>) -> Result<()> {
    match expected {
        Some(expected) if Some(expected) != stored.resource_version() => {
            Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected.to_string(),
                actual: stored.resource_version().unwrap_or("").to_string(),
            })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Object> {
        let id = key.storage_id()?;
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Object>> {
        let group = GroupVersion::parse(api_version)?.group;
        let prefix = match namespace {
            Some(ns) => format!("{}/{}/{}/", group, kind, ns),
            None => format!("{}/{}/", group, kind),
        };
        let inner = self.inner.lock().await;
        Ok(inner
            .objects
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, mut object: Object) -> Result<Object> {
        let key = object.key()?;
        let id = key.storage_id()?;
        let mut inner = self.inner.lock().await;
        if inner.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists(key));
        }
        object.metadata_mut().remove("deletionTimestamp");
        let version = inner.next_version();
        object.set_resource_version(Some(&version));
        inner.objects.insert(id, object.clone());
        drop(inner);
        self.publish(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: Object) -> Result<Object> {
        let key = object.key()?;
        let id = key.storage_id()?;
        let mut inner = self.inner.lock().await;
        let stored = inner
            .objects
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(&key, stored, object.resource_version())?;

        // Deletion can be requested, but not withdrawn.
        match stored.deletion_timestamp().map(str::to_string) {
            Some(ts) => object.set_deletion_timestamp(&ts),
            None => {
                object.metadata_mut().remove("deletionTimestamp");
            }
        }
        let version = inner.next_version();
        object.set_resource_version(Some(&version));

        if object.deletion_timestamp().is_some() && object.finalizers().is_empty() {
            inner.objects.remove(&id);
            drop(inner);
            self.publish(WatchEvent::Deleted(object.clone()));
        } else {
            inner.objects.insert(id, object.clone());
            drop(inner);
            self.publish(WatchEvent::Modified(object.clone()));
        }
        Ok(object)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        if !patch.is_object() {
            return Err(StoreError::Invalid(
                "a merge patch must be a JSON object".to_string(),
            ));
        }
        let id = key.storage_id()?;
        let mut inner = self.inner.lock().await;
        let stored = inner
            .objects
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_version(key, stored, resource_version_precondition(patch))?;

        let deletion_timestamp = stored.deletion_timestamp().map(str::to_string);
        let mut merged = stored.clone().into_value();
        json_patch::merge(&mut merged, patch);
        let mut object = Object::from_value(merged)?;

        let merged_id = object
            .key()
            .and_then(|k| k.storage_id())
            .map_err(|e| StoreError::Invalid(format!("patch broke object identity: {}", e)))?;
        if merged_id != id {
            return Err(StoreError::Invalid(format!(
                "patch may not change the identity of {}",
                key
            )));
        }
        match deletion_timestamp {
            Some(ts) => object.set_deletion_timestamp(&ts),
            None => {
                object.metadata_mut().remove("deletionTimestamp");
            }
        }
        let version = inner.next_version();
        object.set_resource_version(Some(&version));
        inner.objects.insert(id, object.clone());
        drop(inner);
        self.publish(WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Option<Object>> {
        let id = key.storage_id()?;
        let mut inner = self.inner.lock().await;
        let mut object = inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if object.finalizers().is_empty() {
            inner.objects.remove(&id);
            drop(inner);
            self.publish(WatchEvent::Deleted(object));
            return Ok(None);
        }
        if object.deletion_timestamp().is_some() {
            return Ok(Some(object));
        }
        object.set_deletion_timestamp(&Utc::now().to_rfc3339());
        let version = inner.next_version();
        object.set_resource_version(Some(&version));
        inner.objects.insert(id, object.clone());
        drop(inner);
        self.publish(WatchEvent::Modified(object.clone()));
        Ok(Some(object))
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
