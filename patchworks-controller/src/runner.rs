//! Drives reconciles: a de-duplicating work queue with retries.
//!
//! A name is never reconciled twice at the same time. Requests for a name
//! that is in flight are remembered and served once it completes.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use patchworks_core::{patch, NamespacedName, Object};
use patchworks_store::WatchEvent;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    interrupt::InterruptedError, source::SourceKind, Context, Error, InterruptState, Outcome,
    Reconciler, Result,
};

/// How often a waiting controller looks at the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_concurrent_reconciles: usize,
    /// Delay before the first retry. Doubles with every further failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Failures after which a name is given up on. Unlimited if `None`.
    pub max_retries: Option<u32>,
    /// A reconcile that runs longer stops at its next store call and counts
    /// as failed.
    pub reconcile_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            max_concurrent_reconciles: 1,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_retries: None,
            reconcile_timeout: None,
        }
    }
}

impl ControllerConfig {
    /// The delay after the `failures`th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Successful reconciles
    pub reconciled: usize,
    /// Names that were given up on, with the last error
    pub failed: Vec<(NamespacedName, String)>,
}

#[derive(Default)]
struct WorkQueue {
    ready: VecDeque<NamespacedName>,
    queued: BTreeSet<NamespacedName>,
    in_flight: BTreeSet<NamespacedName>,
    /// Requested while in flight
    dirty: BTreeSet<NamespacedName>,
    delayed: Vec<(Instant, NamespacedName)>,
}

impl WorkQueue {
    fn add(&mut self, name: NamespacedName) {
        if self.in_flight.contains(&name) {
            self.dirty.insert(name);
        } else if self.queued.insert(name.clone()) {
            self.ready.push_back(name);
        }
    }

    fn add_after(&mut self, name: NamespacedName, delay: Duration) {
        self.delayed.push((Instant::now() + delay, name));
    }

    /// Moves delayed names that are due to the ready queue.
    fn promote(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|(at, _)| *at <= now);
        self.delayed = later;
        for (_, name) in due {
            self.add(name);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn pop(&mut self) -> Option<NamespacedName> {
        let name = self.ready.pop_front()?;
        self.queued.remove(&name);
        self.in_flight.insert(name.clone());
        Some(name)
    }

    fn done(&mut self, name: &NamespacedName) {
        self.in_flight.remove(name);
        if self.dirty.remove(name) {
            self.add(name.clone());
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    UntilIdle,
    Watch,
}

type TaskResult = (NamespacedName, Result<Outcome>);

/// An in-process stand-in for a cluster's controller runtime.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(ctx: Context, config: ControllerConfig) -> Self {
        Controller {
            reconciler: Arc::new(Reconciler::new(ctx)),
            config,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Reconciles every patch, including requeues and retries, until there is
    /// no work left.
    pub async fn run_until_idle(&self, interrupt: &InterruptState) -> Result<SyncReport> {
        self.run_loop(Mode::UntilIdle, None, interrupt).await
    }

    /// Reconciles every patch, then keeps reconciling in response to changes
    /// in the store until interrupted.
    pub async fn run(&self, interrupt: &InterruptState) -> Result<SyncReport> {
        let events = self.reconciler.context().store.watch();
        self.run_loop(Mode::Watch, Some(events), interrupt).await
    }

    async fn list_patches(&self) -> Result<Vec<NamespacedName>> {
        let objects = self
            .reconciler
            .context()
            .store
            .list(patch::API_VERSION, patch::KIND, None)
            .await
            .map_err(Error::ListFailed)?;
        Ok(objects
            .iter()
            .filter_map(|o| o.key().ok())
            .map(|k| k.namespaced_name())
            .collect())
    }

    /// The patches to reconcile after `object` changed.
    async fn affected_by(&self, object: &Object) -> Result<Vec<NamespacedName>> {
        let Ok(key) = object.key() else {
            return Ok(Vec::new());
        };
        if key.api_version == patch::API_VERSION && key.kind == patch::KIND {
            return Ok(vec![key.namespaced_name()]);
        }
        // Targets are deliberately not watched: every apply writes them.
        if key.api_version != crate::source::SOURCE_API_VERSION
            || key.kind.parse::<SourceKind>().is_err()
        {
            return Ok(Vec::new());
        }
        let patches = self
            .reconciler
            .context()
            .store
            .list(patch::API_VERSION, patch::KIND, None)
            .await
            .map_err(Error::ListFailed)?;
        Ok(patches
            .into_iter()
            .filter_map(|o| patchworks_core::Patch::from_object(o).ok())
            .filter(|p| {
                let target = crate::reconciler::effective_target(p);
                p.spec.source.kind == key.kind
                    && p.spec.source.name == key.name
                    && target.namespace == key.namespace
            })
            .map(|p| p.namespaced_name())
            .collect())
    }

    async fn run_loop(
        &self,
        mode: Mode,
        mut events: Option<broadcast::Receiver<WatchEvent>>,
        interrupt: &InterruptState,
    ) -> Result<SyncReport> {
        let mut queue = WorkQueue::default();
        let mut failures: HashMap<NamespacedName, u32> = HashMap::new();
        let mut report = SyncReport::default();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        interrupt.check_interrupted()?;
        for name in self.list_patches().await? {
            queue.add(name);
        }

        loop {
            if let Err(e) = interrupt.check_interrupted() {
                tasks.shutdown().await;
                return match mode {
                    Mode::UntilIdle => Err(e.into()),
                    Mode::Watch => Ok(report),
                };
            }

            queue.promote(Instant::now());
            while tasks.len() < self.config.max_concurrent_reconciles.max(1) {
                let Some(name) = queue.pop() else { break };
                let reconciler = self.reconciler.clone();
                let interrupt = match self.config.reconcile_timeout {
                    Some(timeout) => interrupt.with_deadline(std::time::Instant::now() + timeout),
                    None => interrupt.clone(),
                };
                tasks.spawn(async move {
                    let result = reconciler.reconcile(&name, &interrupt).await;
                    (name, result)
                });
            }

            if mode == Mode::UntilIdle && queue.is_idle() && tasks.is_empty() {
                return Ok(report);
            }

            let deadline = queue.next_deadline();
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (name, result) = match joined {
                        Ok(r) => r,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => {
                            warn!(error = %e, "reconcile task ended abnormally");
                            continue;
                        }
                    };
                    queue.done(&name);
                    self.handle_result(name, result, &mut queue, &mut failures, &mut report)?;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
                event = recv(&mut events), if events.is_some() => {
                    match event {
                        Ok(event) => {
                            for name in self.affected_by(event.object()).await? {
                                queue.add(name);
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(missed = n, "missed store events, resyncing");
                            for name in self.list_patches().await? {
                                queue.add(name);
                            }
                        }
                        Err(RecvError::Closed) => {
                            debug!("store event stream closed");
                            events = None;
                        }
                    }
                }
                _ = tokio::time::sleep(INTERRUPT_POLL) => {
                    if mode == Mode::Watch {
                        // Writes by other processes arrive as watch events.
                        if let Err(e) = self.reconciler.context().store.refresh().await {
                            warn!(error = %e, "cannot refresh the store");
                        }
                    }
                }
            }
        }
    }

    fn handle_result(
        &self,
        name: NamespacedName,
        result: Result<Outcome>,
        queue: &mut WorkQueue,
        failures: &mut HashMap<NamespacedName, u32>,
        report: &mut SyncReport,
    ) -> Result<()> {
        match result {
            Ok(outcome) => {
                info!(patch = %name, "{}", outcome);
                report.reconciled += 1;
                failures.remove(&name);
                if outcome.requeue() {
                    queue.add(name);
                }
                Ok(())
            }
            Err(Error::Cancelled(InterruptedError::Interrupted)) => {
                // The loop notices the interrupt itself.
                debug!(patch = %name, "reconcile cancelled");
                Ok(())
            }
            Err(e) => {
                let count = failures.entry(name.clone()).or_default();
                *count += 1;
                let message = e.chain();
                if self.config.max_retries.is_some_and(|max| *count > max) {
                    warn!(patch = %name, attempts = *count, "giving up: {}", message);
                    failures.remove(&name);
                    report.failed.push((name, message));
                } else {
                    let delay = self.config.backoff(*count);
                    warn!(patch = %name, retry_in = ?delay, "reconcile failed: {}", message);
                    queue.add_after(name, delay);
                }
                Ok(())
            }
        }
    }
}

async fn recv(events: &mut Option<broadcast::Receiver<WatchEvent>>) -> std::result::Result<WatchEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::RecordingEventSink, test_support};
    use patchworks_core::{patch::annotations, ObjectKey};
    use patchworks_store::{MemoryStore, ObjectStore};
    use serde_json::json;

    fn name(n: &str) -> NamespacedName {
        NamespacedName::new("web", n)
    }

    fn target_key() -> ObjectKey {
        ObjectKey::new("apps/v1", "Deployment", "web", "nginx")
    }

    fn controller(store: Arc<MemoryStore>, config: ControllerConfig) -> Controller {
        Controller::new(
            Context::new(store, Arc::new(RecordingEventSink::new())),
            config,
        )
    }

    #[test]
    fn queue_deduplicates() {
        let mut q = WorkQueue::default();
        q.add(name("a"));
        q.add(name("b"));
        q.add(name("a"));
        assert_eq!(q.pop(), Some(name("a")));
        // a is in flight: a second request waits for it
        q.add(name("a"));
        assert_eq!(q.pop(), Some(name("b")));
        assert_eq!(q.pop(), None);
        q.done(&name("a"));
        assert_eq!(q.pop(), Some(name("a")));
        q.done(&name("a"));
        q.done(&name("b"));
        assert!(q.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_delays() {
        let mut q = WorkQueue::default();
        q.add_after(name("a"), Duration::from_secs(1));
        assert!(!q.is_idle());
        q.promote(Instant::now());
        assert_eq!(q.pop(), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        q.promote(Instant::now());
        assert_eq!(q.pop(), Some(name("a")));
    }

    #[test]
    fn backoff_doubles_up_to_the_limit() {
        let config = ControllerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(30), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn sync_adds_finalizer_then_applies() {
        let store = Arc::new(test_support::store_with_target().await);
        store
            .create(test_support::patch("ConfigMap", "image: {{.name}}"))
            .await
            .unwrap();
        let report = controller(store.clone(), ControllerConfig::default())
            .run_until_idle(&InterruptState::new())
            .await
            .unwrap();
        assert_eq!(report.reconciled, 2);
        assert!(report.failed.is_empty());
        let target = store.get(&target_key()).await.unwrap();
        assert_eq!(target.as_map()["image"], json!("nginx"));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_gives_up_after_max_retries() {
        let store = Arc::new(test_support::store_with_target().await);
        store
            .create(test_support::patch("ConfigMap", "image: {{.missing}}"))
            .await
            .unwrap();
        let config = ControllerConfig {
            max_retries: Some(2),
            ..ControllerConfig::default()
        };
        let report = controller(store, config)
            .run_until_idle(&InterruptState::new())
            .await
            .unwrap();
        // The finalizer was added, then three attempts failed
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, name("image"));
        assert!(report.failed[0].1.contains("map has no entry for key \"missing\""));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_timeout_counts_as_failure() {
        let store = Arc::new(test_support::store_with_target().await);
        store
            .create(test_support::patch("ConfigMap", "image: {{.name}}"))
            .await
            .unwrap();
        let config = ControllerConfig {
            max_retries: Some(1),
            reconcile_timeout: Some(Duration::ZERO),
            ..ControllerConfig::default()
        };
        let report = controller(store.clone(), config)
            .run_until_idle(&InterruptState::new())
            .await
            .unwrap();
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("deadline exceeded"), "{}", report.failed[0].1);
        let patch = store
            .get(&patch::Patch::key_for(&name("image")))
            .await
            .unwrap();
        assert!(patch.finalizers().is_empty());
    }

    #[tokio::test]
    async fn sync_reverts_deleted_patches() {
        let store = Arc::new(test_support::store_with_target().await);
        let original = store.get(&target_key()).await.unwrap();
        store
            .create(test_support::patch("ConfigMap", "image: {{.name}}"))
            .await
            .unwrap();
        let c = controller(store.clone(), ControllerConfig::default());
        c.run_until_idle(&InterruptState::new()).await.unwrap();
        store
            .delete(&patch::Patch::key_for(&name("image")))
            .await
            .unwrap();
        c.run_until_idle(&InterruptState::new()).await.unwrap();

        let mut target = store.get(&target_key()).await.unwrap();
        assert_eq!(target.annotation(annotations::PATCH_ID), None);
        target.set_resource_version(original.resource_version());
        assert_eq!(target, original);
    }

    #[tokio::test]
    async fn interrupted_sync_is_cancelled() {
        let store = Arc::new(test_support::store_with_target().await);
        let interrupt = InterruptState::new();
        interrupt.set_interrupted();
        let err = controller(store, ControllerConfig::default())
            .run_until_idle(&interrupt)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn watch_follows_source_changes() {
        let store = Arc::new(test_support::store_with_target().await);
        let c = Arc::new(controller(store.clone(), ControllerConfig::default()));
        let interrupt = InterruptState::new();
        let handle = {
            let c = c.clone();
            let interrupt = interrupt.clone();
            tokio::spawn(async move { c.run(&interrupt).await })
        };

        store
            .create(test_support::patch("ConfigMap", "image: {{.name}}"))
            .await
            .unwrap();
        wait_for_image(&store, "nginx").await;

        store
            .patch(
                &ObjectKey::new("v1", "ConfigMap", "web", "settings"),
                &json!({ "data": { "name": "httpd" } }),
            )
            .await
            .unwrap();
        wait_for_image(&store, "httpd").await;

        interrupt.set_interrupted();
        let report = handle.await.unwrap().unwrap();
        assert!(report.reconciled >= 3);
    }

    /// Holds back an object that "another process" wrote until the next
    /// refresh.
    struct SharedStore {
        inner: MemoryStore,
        foreign: std::sync::Mutex<Option<Object>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for SharedStore {
        async fn get(&self, key: &ObjectKey) -> patchworks_store::Result<Object> {
            self.inner.get(key).await
        }

        async fn list(
            &self,
            api_version: &str,
            kind: &str,
            namespace: Option<&str>,
        ) -> patchworks_store::Result<Vec<Object>> {
            self.inner.list(api_version, kind, namespace).await
        }

        async fn create(&self, object: Object) -> patchworks_store::Result<Object> {
            self.inner.create(object).await
        }

        async fn update(&self, object: Object) -> patchworks_store::Result<Object> {
            self.inner.update(object).await
        }

        async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> patchworks_store::Result<Object> {
            self.inner.patch(key, patch).await
        }

        async fn delete(&self, key: &ObjectKey) -> patchworks_store::Result<Option<Object>> {
            self.inner.delete(key).await
        }

        fn watch(&self) -> broadcast::Receiver<WatchEvent> {
            self.inner.watch()
        }

        async fn refresh(&self) -> patchworks_store::Result<()> {
            let foreign = self.foreign.lock().expect("mutex poisoned").take();
            if let Some(object) = foreign {
                self.inner.create(object).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn watch_refreshes_the_store_while_idle() {
        let store = Arc::new(SharedStore {
            inner: test_support::store_with_target().await,
            foreign: std::sync::Mutex::new(None),
        });
        let c = Arc::new(Controller::new(
            Context::new(store.clone(), Arc::new(RecordingEventSink::new())),
            ControllerConfig::default(),
        ));
        let interrupt = InterruptState::new();
        let handle = {
            let c = c.clone();
            let interrupt = interrupt.clone();
            tokio::spawn(async move { c.run(&interrupt).await })
        };

        *store.foreign.lock().unwrap() =
            Some(test_support::patch("ConfigMap", "image: {{.name}}"));
        wait_for_image(&store.inner, "nginx").await;

        interrupt.set_interrupted();
        let report = handle.await.unwrap().unwrap();
        assert!(report.reconciled >= 2);
    }

    async fn wait_for_image(store: &MemoryStore, image: &str) {
        for _ in 0..200 {
            let target = store.get(&target_key()).await.unwrap();
            if target.as_map().get("image") == Some(&json!(image)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("target never got image {}", image);
    }
}
