use std::{future::Future, path::Path};

use anyhow::Context as _;
use async_trait::async_trait;
use patchworks_core::{Object, ObjectKey};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::{
    journal::{apply_journal_event, apply_journal_events, JournalEvent, JournalHandle, JournalLock},
    MemoryStore, ObjectStore, Result, WatchEvent,
};

/// A [`MemoryStore`] whose writes are recorded in a journal file.
///
/// Opening the store replays the journal; every successful write appends one
/// event holding the difference between the state before and after it.
/// Several processes may share a journal: each write holds the journal lock
/// and first replays what the others appended, so `resourceVersion`
/// preconditions are checked against the latest state.
pub struct FileStore {
    memory: MemoryStore,
    journal: Mutex<Journal>,
}

struct Journal {
    handle: JournalHandle,
    next_index: u64,
    /// The state as of the last event in the file
    state: Value,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileStore> {
        let path = path.as_ref();
        let (mut handle, created) = JournalHandle::open_or_create(path)
            .with_context(|| format!("opening store journal {}", path.display()))?;
        let (state, next_index) = if created {
            tracing::info!(path = %path.display(), "Created new store journal");
            (JournalHandle::initial_state(), 1)
        } else {
            let events = handle
                .lock()?
                .read_new_events()
                .with_context(|| format!("reading store journal {}", path.display()))?;
            let mut state = serde_json::json!({});
            let count = apply_journal_events(&mut state, events.into_iter().map(Ok))
                .with_context(|| format!("replaying store journal {}", path.display()))?;
            (state, count)
        };
        let memory = MemoryStore::from_state(&state)?;
        Ok(FileStore {
            memory,
            journal: Mutex::new(Journal {
                handle,
                next_index,
                state,
            }),
        })
    }

    /// Runs a write against the in-memory state and records its effect.
    ///
    /// The journal lock is held from catching up until the event is
    /// appended, so no other process can write in between.
    async fn record<T, F>(&self, operation: &str, write: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut guard = self.journal.lock().await;
        let journal = &mut *guard;
        let mut lock = journal.handle.lock()?;
        catch_up(
            &self.memory,
            &mut journal.state,
            &mut journal.next_index,
            &mut lock,
        )
        .await?;

        let r = write.await?;
        let after = self.memory.export().await;
        let patch = json_patch::diff(&journal.state, &after);
        if !patch.0.is_empty() {
            let event = JournalEvent::new(journal.next_index, operation, patch);
            if let Err(e) = lock.append(&[&event]) {
                // Memory must not get ahead of the file.
                self.memory.reload(&journal.state).await?;
                return Err(e.context("appending to the store journal").into());
            }
            journal.next_index += 1;
            journal.state = after;
        }
        Ok(r)
    }
}

/// Replays events that other processes appended since we last looked.
async fn catch_up(
    memory: &MemoryStore,
    state: &mut Value,
    next_index: &mut u64,
    lock: &mut JournalLock<'_>,
) -> Result<()> {
    let events = lock.read_new_events()?;
    if events.is_empty() {
        return Ok(());
    }
    for event in &events {
        if event.index != *next_index {
            return Err(anyhow::anyhow!(
                "store journal event {} is out of sequence; expected {}",
                event.index,
                next_index
            )
            .into());
        }
        apply_journal_event(state, event)?;
        *next_index += 1;
    }
    debug!(events = events.len(), "Replayed store journal events from another writer");
    memory.reload(state).await
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get(&self, key: &ObjectKey) -> Result<Object> {
        self.refresh().await?;
        self.memory.get(key).await
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Object>> {
        self.refresh().await?;
        self.memory.list(api_version, kind, namespace).await
    }

    async fn create(&self, object: Object) -> Result<Object> {
        self.record("create", self.memory.create(object)).await
    }

    async fn update(&self, object: Object) -> Result<Object> {
        self.record("update", self.memory.update(object)).await
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        self.record("patch", self.memory.patch(key, patch)).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Option<Object>> {
        self.record("delete", self.memory.delete(key)).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.memory.watch()
    }

    async fn refresh(&self) -> Result<()> {
        let mut guard = self.journal.lock().await;
        let journal = &mut *guard;
        if !journal.handle.has_unread_events()? {
            return Ok(());
        }
        let mut lock = journal.handle.lock()?;
        catch_up(
            &self.memory,
            &mut journal.state,
            &mut journal.next_index,
            &mut lock,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret() -> Object {
        Object::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "creds", "namespace": "web" },
            "data": { "password": "aHVudGVyMg==" },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let key = ObjectKey::new("v1", "Secret", "web", "creds");
        {
            let store = FileStore::open(&path).unwrap();
            store.create(secret()).await.unwrap();
            store
                .patch(&key, &json!({"data": {"user": "YWRtaW4="}}))
                .await
                .unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        let o = store.get(&key).await.unwrap();
        assert_eq!(o.resource_version(), Some("2"));
        assert_eq!(o.as_map()["data"]["user"], "YWRtaW4=");

        // The version counter continues where it left off
        let o = store
            .patch(&key, &json!({"data": {"user": null}}))
            .await
            .unwrap();
        assert_eq!(o.resource_version(), Some("3"));
    }

    #[tokio::test]
    async fn failed_writes_are_not_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path).unwrap();
        store.create(secret()).await.unwrap();
        assert!(store.create(secret()).await.is_err());
        let journal = store.journal.lock().await;
        assert_eq!(journal.next_index, 2);
    }

    #[tokio::test]
    async fn writers_sharing_a_journal_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let key = ObjectKey::new("v1", "Secret", "web", "creds");
        let a = FileStore::open(&path).unwrap();
        a.create(secret()).await.unwrap();
        let b = FileStore::open(&path).unwrap();

        let from_a = json!({ "metadata": { "resourceVersion": "1" }, "data": { "a": "QQ==" } });
        let from_b = json!({ "metadata": { "resourceVersion": "1" }, "data": { "a": "Qg==" } });
        let written = a.patch(&key, &from_a).await.unwrap();
        assert_eq!(written.resource_version(), Some("2"));
        let err = b.patch(&key, &from_b).await.unwrap_err();
        assert!(err.is_conflict(), "{}", err);

        // b has caught up with a's write and builds on it
        let seen = b.get(&key).await.unwrap();
        assert_eq!(seen.as_map()["data"]["a"], "QQ==");
        let next = b
            .patch(&key, &json!({ "metadata": { "resourceVersion": "2" }, "data": { "b": "Qg==" } }))
            .await
            .unwrap();
        assert_eq!(next.resource_version(), Some("3"));

        let reopened = FileStore::open(&path).unwrap();
        let o = reopened.get(&key).await.unwrap();
        assert_eq!(o.as_map()["data"]["a"], "QQ==");
        assert_eq!(o.as_map()["data"]["b"], "Qg==");
        assert_eq!(o.resource_version(), Some("3"));
    }

    #[tokio::test]
    async fn refresh_reports_writes_of_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let key = ObjectKey::new("v1", "Secret", "web", "creds");
        let a = FileStore::open(&path).unwrap();
        let b = FileStore::open(&path).unwrap();
        let mut events = b.watch();

        a.create(secret()).await.unwrap();
        assert!(events.try_recv().is_err());
        b.refresh().await.unwrap();
        match events.try_recv().unwrap() {
            WatchEvent::Added(o) => assert_eq!(o.name(), Some("creds")),
            other => panic!("unexpected event {:?}", other),
        }

        a.delete(&key).await.unwrap();
        assert!(b.get(&key).await.unwrap_err().is_not_found());
        assert!(matches!(events.try_recv().unwrap(), WatchEvent::Deleted(_)));
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
