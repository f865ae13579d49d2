//! Local replica of every Service in the cluster, indexed by name and by namespace/name.
//!
//! One background task owns all writes. Both indices live behind a single lock so a reader
//! sees a service in both or in neither.

use super::source::{namespace_name_key, ServiceRecord, ServiceSource, SourceError, WatchEvent, WatchStream};
use crate::plugin::prometheus::{KUBELB_SERVICES, KUBELB_WATCH_EVENTS_TOTAL};
use crate::plugin::Readiness;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("service source: {0}")]
    Source(#[from] SourceError),

    #[error("mirror already started")]
    AlreadyStarted,

    #[error("shutdown already in progress")]
    AlreadyStopping,

    #[error("service index unavailable: {0}")]
    IndexUnavailable(String),
}

#[derive(Debug, Default)]
struct Indices {
    by_name: HashMap<String, Vec<Arc<ServiceRecord>>>,
    by_namespace_name: HashMap<String, Arc<ServiceRecord>>,
}

impl Indices {
    fn upsert(&mut self, svc: ServiceRecord) {
        let key = svc.key();
        self.unlink(&key);
        let svc = Arc::new(svc);
        self.by_name.entry(svc.name.clone()).or_default().push(svc.clone());
        self.by_namespace_name.insert(key, svc);
    }

    fn remove(&mut self, namespace: &str, name: &str) -> bool {
        self.unlink(&namespace_name_key(namespace, name))
    }

    fn unlink(&mut self, key: &str) -> bool {
        let Some(old) = self.by_namespace_name.remove(key) else { return false };
        if let Some(list) = self.by_name.get_mut(&old.name) {
            list.retain(|svc| svc.namespace != old.namespace);
            if list.is_empty() {
                self.by_name.remove(&old.name);
            }
        }
        true
    }

    fn replace_all(&mut self, services: Vec<ServiceRecord>) {
        self.by_name.clear();
        self.by_namespace_name.clear();
        for svc in services {
            self.upsert(svc);
        }
    }

    fn len(&self) -> usize {
        self.by_namespace_name.len()
    }
}

pub struct Mirror {
    source: Arc<dyn ServiceSource>,
    indices: RwLock<Indices>,
    ready: AtomicBool,
    stop_lock: Mutex<bool>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Mirror {
    pub fn new(source: Arc<dyn ServiceSource>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            source,
            indices: RwLock::new(Indices::default()),
            ready: AtomicBool::new(false),
            stop_lock: Mutex::new(false),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Lists every service, marks the mirror ready and spawns the watch task.
    /// A failed listing is returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<(), MirrorError> {
        if self.task.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Err(MirrorError::AlreadyStarted);
        }

        let count = self.relist().await?;
        let stream = match self.source.watch().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!("[kubeloadbalancer] {}; will retry in the background", e);
                None
            }
        };
        self.ready.store(true, Ordering::Release);
        tracing::info!("[kubeloadbalancer] Initial sync complete: {} services", count);

        let mirror = self.clone();
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move { mirror.run(stream, stop_rx).await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Signals the watch task to exit. Only the first call succeeds.
    pub fn stop(&self) -> Result<(), MirrorError> {
        let mut shutdown = self.stop_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *shutdown {
            return Err(MirrorError::AlreadyStopping);
        }
        *shutdown = true;
        self.stop_tx.send_replace(true);
        Ok(())
    }

    /// Waits for the watch task to finish after `stop`.
    pub async fn stopped(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Every service called `name`, across namespaces.
    pub fn lookup_by_name(&self, name: &str) -> Result<Vec<Arc<ServiceRecord>>, MirrorError> {
        let indices = self.read()?;
        Ok(indices.by_name.get(name).cloned().unwrap_or_default())
    }

    pub fn lookup_by_namespace_name(&self, namespace: &str, name: &str) -> Result<Option<Arc<ServiceRecord>>, MirrorError> {
        let indices = self.read()?;
        Ok(indices.by_namespace_name.get(&namespace_name_key(namespace, name)).cloned())
    }

    pub fn service_count(&self) -> usize {
        self.read().map(|i| i.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Indices>, MirrorError> {
        self.indices.read().map_err(|e| MirrorError::IndexUnavailable(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Indices>, MirrorError> {
        self.indices.write().map_err(|e| MirrorError::IndexUnavailable(e.to_string()))
    }

    /// Rebuilds both indices from a full listing. A full replace leaves nothing of a
    /// half-applied update, so this is also where a poisoned lock is recovered.
    async fn relist(&self) -> Result<usize, MirrorError> {
        let services = self.source.list().await?;
        let count = {
            let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
            indices.replace_all(services);
            indices.len()
        };
        if self.indices.is_poisoned() {
            tracing::warn!("[kubeloadbalancer] Service index recovered from a failed update");
            self.indices.clear_poison();
        }
        KUBELB_SERVICES.set(count as i64);
        Ok(count)
    }

    fn apply(&self, event: WatchEvent) -> Result<(), MirrorError> {
        let mut indices = self.write()?;
        match event {
            WatchEvent::Applied(svc) => {
                tracing::debug!("[kubeloadbalancer] Service {} applied ({} ingress)", svc.key(), svc.ingress.len());
                KUBELB_WATCH_EVENTS_TOTAL.with_label_values(&["applied"]).inc();
                indices.upsert(svc);
            }
            WatchEvent::Deleted(svc) => {
                tracing::debug!("[kubeloadbalancer] Service {} deleted", svc.key());
                KUBELB_WATCH_EVENTS_TOTAL.with_label_values(&["deleted"]).inc();
                indices.remove(&svc.namespace, &svc.name);
            }
            WatchEvent::Restarted(all) => {
                tracing::info!("[kubeloadbalancer] Watch restarted, resynced {} services", all.len());
                KUBELB_WATCH_EVENTS_TOTAL.with_label_values(&["restarted"]).inc();
                indices.replace_all(all);
            }
        }
        KUBELB_SERVICES.set(indices.len() as i64);
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stream: Option<WatchStream>, mut stop_rx: watch::Receiver<bool>) {
        let mut backoff_secs = 1u64;
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let mut events = match stream.take() {
                Some(events) => events,
                None => match self.resync().await {
                    Ok(events) => {
                        backoff_secs = 1;
                        events
                    }
                    Err(e) => {
                        tracing::warn!("[kubeloadbalancer] Resync failed: {}; retrying in {}s", e, backoff_secs);
                        if wait_or_stop(&mut stop_rx, backoff_secs).await { break; }
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                },
            };

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        tracing::info!("[kubeloadbalancer] Watch stopped");
                        return;
                    }
                    next = events.next() => {
                        match next {
                            Some(Ok(event)) => {
                                if let Err(e) = self.apply(event) {
                                    tracing::error!("[kubeloadbalancer] {}; resyncing in {}s", e, backoff_secs);
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                KUBELB_WATCH_EVENTS_TOTAL.with_label_values(&["error"]).inc();
                                tracing::warn!("[kubeloadbalancer] {}", e);
                            }
                            None => {
                                tracing::warn!("[kubeloadbalancer] Service watch closed; reconnecting in {}s", backoff_secs);
                                break;
                            }
                        }
                    }
                }
            }

            if wait_or_stop(&mut stop_rx, backoff_secs).await { break; }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
        tracing::info!("[kubeloadbalancer] Watch stopped");
    }

    async fn resync(&self) -> Result<WatchStream, MirrorError> {
        let count = self.relist().await?;
        let events = self.source.watch().await?;
        tracing::info!("[kubeloadbalancer] Resynced {} services and reopened the watch", count);
        Ok(events)
    }
}

#[cfg(test)]
impl Mirror {
    /// Leaves the index lock poisoned, as a panicking writer would.
    pub(crate) fn poison_indices(&self) {
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _guard = self.indices.write();
                    panic!("writer failed mid-update");
                })
                .join();
        });
    }
}

impl Readiness for Mirror {
    fn ready(&self) -> bool {
        Mirror::ready(self)
    }
}

/// Sleeps for the backoff unless a stop arrives first. Returns true when stopping.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, secs: u64) -> bool {
    tokio::select! {
        _ = stop_rx.changed() => true,
        _ = sleep(Duration::from_secs(secs)) => *stop_rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::kubeloadbalancer::source::MemorySource;
    use std::time::Instant;

    async fn eventually<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn names(list: &[Arc<ServiceRecord>]) -> Vec<String> {
        let mut keys: Vec<String> = list.iter().map(|s| s.key()).collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn start_populates_both_indices_and_sets_ready() {
        let source = Arc::new(MemorySource::new(vec![
            ServiceRecord::new("ns1", "svc1", &["10.0.0.1"]),
            ServiceRecord::new("ns2", "svc1", &["10.0.0.2"]),
            ServiceRecord::new("ns1", "other", &[]),
        ]));
        let mirror = Arc::new(Mirror::new(source));
        assert!(!mirror.ready());

        mirror.start().await.unwrap();
        assert!(mirror.ready());
        assert_eq!(mirror.service_count(), 3);
        assert_eq!(names(&mirror.lookup_by_name("svc1").unwrap()), vec!["ns1/svc1", "ns2/svc1"]);
        assert!(mirror.lookup_by_name("missing").unwrap().is_empty());

        let one = mirror.lookup_by_namespace_name("ns2", "svc1").unwrap().unwrap();
        assert_eq!(one.ingress, vec!["10.0.0.2".to_string()]);
        assert!(mirror.lookup_by_namespace_name("ns3", "svc1").unwrap().is_none());

        mirror.stop().unwrap();
        mirror.stopped().await;
    }

    #[tokio::test]
    async fn initial_listing_failure_is_returned() {
        let mirror = Arc::new(Mirror::new(Arc::new(MemorySource::unreachable())));
        let err = mirror.start().await.unwrap_err();
        assert!(matches!(err, MirrorError::Source(SourceError::List(_))));
        assert!(!mirror.ready());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mirror = Arc::new(Mirror::new(Arc::new(MemorySource::new(Vec::new()))));
        mirror.start().await.unwrap();
        assert!(matches!(mirror.start().await, Err(MirrorError::AlreadyStarted)));
        mirror.stop().unwrap();
    }

    #[tokio::test]
    async fn watch_events_update_both_indices() {
        let source = Arc::new(MemorySource::new(vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])]));
        let mirror = Arc::new(Mirror::new(source.clone()));
        mirror.start().await.unwrap();

        source.apply(ServiceRecord::new("ns2", "svc1", &["10.0.0.2"]));
        eventually(|| mirror.lookup_by_name("svc1").unwrap().len() == 2).await;
        assert!(mirror.lookup_by_namespace_name("ns2", "svc1").unwrap().is_some());

        // update replaces in place, no duplicate in the name index
        source.apply(ServiceRecord::new("ns1", "svc1", &["10.0.0.9"]));
        eventually(|| {
            mirror.lookup_by_namespace_name("ns1", "svc1").unwrap().map(|s| s.ingress.clone()) == Some(vec!["10.0.0.9".to_string()])
        }).await;
        assert_eq!(mirror.lookup_by_name("svc1").unwrap().len(), 2);

        source.delete("ns1", "svc1");
        eventually(|| mirror.lookup_by_namespace_name("ns1", "svc1").unwrap().is_none()).await;
        assert_eq!(names(&mirror.lookup_by_name("svc1").unwrap()), vec!["ns2/svc1"]);

        source.delete("ns2", "svc1");
        eventually(|| mirror.lookup_by_name("svc1").unwrap().is_empty()).await;
        assert_eq!(mirror.service_count(), 0);

        mirror.stop().unwrap();
        mirror.stopped().await;
    }

    #[tokio::test]
    async fn restarted_watch_replaces_everything() {
        let source = Arc::new(MemorySource::new(vec![ServiceRecord::new("ns1", "old", &["10.0.0.1"])]));
        let mirror = Arc::new(Mirror::new(source.clone()));
        mirror.start().await.unwrap();

        source.reset(vec![ServiceRecord::new("ns1", "new", &["10.0.0.2"])]);
        eventually(|| mirror.lookup_by_namespace_name("ns1", "new").unwrap().is_some()).await;
        assert!(mirror.lookup_by_name("old").unwrap().is_empty());
        assert_eq!(mirror.service_count(), 1);
        mirror.stop().unwrap();
    }

    #[tokio::test]
    async fn stop_is_one_shot_and_ends_the_task() {
        let source = Arc::new(MemorySource::new(Vec::new()));
        let mirror = Arc::new(Mirror::new(source.clone()));
        mirror.start().await.unwrap();
        assert_eq!(source.watchers(), 1);

        mirror.stop().unwrap();
        assert!(matches!(mirror.stop(), Err(MirrorError::AlreadyStopping)));
        mirror.stopped().await;
        assert_eq!(source.watchers(), 0);

        // readiness never reverts
        assert!(mirror.ready());
    }

    #[tokio::test]
    async fn concurrent_stop_has_exactly_one_winner() {
        let mirror = Arc::new(Mirror::new(Arc::new(MemorySource::new(Vec::new()))));
        mirror.start().await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = mirror.clone();
                tokio::spawn(async move { m.stop().is_ok() })
            })
            .collect();
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() { wins += 1; }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn poisoned_index_fails_lookups_until_resync() {
        let source = Arc::new(MemorySource::new(vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])]));
        let mirror = Arc::new(Mirror::new(source.clone()));
        mirror.start().await.unwrap();
        // the watch task has caught up once this is visible
        source.apply(ServiceRecord::new("ns3", "marker", &[]));
        eventually(|| mirror.lookup_by_namespace_name("ns3", "marker").unwrap().is_some()).await;

        mirror.poison_indices();
        assert!(matches!(mirror.lookup_by_name("svc1"), Err(MirrorError::IndexUnavailable(_))));
        assert!(matches!(mirror.lookup_by_namespace_name("ns1", "svc1"), Err(MirrorError::IndexUnavailable(_))));

        // the next event cannot be applied, so the task relists and the index comes back
        source.apply(ServiceRecord::new("ns2", "svc1", &["10.0.0.2"]));
        eventually(|| mirror.lookup_by_name("svc1").map(|l| l.len() == 2).unwrap_or(false)).await;
        assert!(mirror.lookup_by_namespace_name("ns2", "svc1").unwrap().is_some());
        mirror.stop().unwrap();
    }

    #[test]
    fn indices_stay_in_step() {
        let mut indices = Indices::default();
        indices.upsert(ServiceRecord::new("a", "web", &["10.0.0.1"]));
        indices.upsert(ServiceRecord::new("b", "web", &["10.0.0.2"]));
        indices.upsert(ServiceRecord::new("a", "web", &["10.0.0.3"]));
        assert_eq!(indices.len(), 2);
        assert_eq!(indices.by_name["web"].len(), 2);

        assert!(indices.remove("a", "web"));
        assert!(!indices.remove("a", "web"));
        assert_eq!(indices.by_name["web"].len(), 1);
        assert!(indices.remove("b", "web"));
        assert!(indices.by_name.is_empty());
        assert!(indices.by_namespace_name.is_empty());
    }
}
