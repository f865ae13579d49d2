//! Where service state comes from: a full listing plus a change stream.

use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

/// The parts of a cluster Service this plugin answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    /// Load balancer ingress IPs in the order the cluster reports them.
    pub ingress: Vec<String>,
}

impl ServiceRecord {
    pub fn new(namespace: &str, name: &str, ingress: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ingress: ingress.iter().map(|ip| ip.to_string()).collect(),
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        namespace_name_key(&self.namespace, &self.name)
    }
}

pub fn namespace_name_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Added or modified.
    Applied(ServiceRecord),
    Deleted(ServiceRecord),
    /// The watch was re-established; this is the complete current set.
    Restarted(Vec<ServiceRecord>),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cluster client unavailable: {0}")]
    Client(String),

    #[error("failed to list services: {0}")]
    List(String),

    #[error("failed to open service watch: {0}")]
    Watch(String),

    #[error("service watch stream error: {0}")]
    Stream(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Lists and watches services across all namespaces.
#[async_trait::async_trait]
pub trait ServiceSource: Send + Sync {
    async fn list(&self) -> Result<Vec<ServiceRecord>, SourceError>;

    /// Opens a change stream. Its first event must be `Restarted` with the full current set,
    /// so that nothing changed between `list` and `watch` is missed. Errors yielded by the
    /// stream are transient and the stream keeps going after them. The stream ending means it
    /// must be reopened.
    async fn watch(&self) -> Result<WatchStream, SourceError>;
}

/// In-process source: services are applied and deleted by hand and fanned out to every
/// open watch.
pub struct MemorySource {
    services: Mutex<BTreeMap<String, ServiceRecord>>,
    events: broadcast::Sender<WatchEvent>,
    reachable: bool,
}

impl MemorySource {
    pub fn new(initial: Vec<ServiceRecord>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let services = initial.into_iter().map(|svc| (svc.key(), svc)).collect();
        Self { services: Mutex::new(services), events, reachable: true }
    }

    /// A source whose listing always fails.
    pub fn unreachable() -> Self {
        Self { reachable: false, ..Self::new(Vec::new()) }
    }

    pub fn apply(&self, svc: ServiceRecord) {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services.insert(svc.key(), svc.clone());
        let _ = self.events.send(WatchEvent::Applied(svc));
    }

    pub fn delete(&self, namespace: &str, name: &str) {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(svc) = services.remove(&namespace_name_key(namespace, name)) {
            let _ = self.events.send(WatchEvent::Deleted(svc));
        }
    }

    /// Replaces the whole set and tells watchers the watch restarted.
    pub fn reset(&self, all: Vec<ServiceRecord>) {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        *services = all.iter().map(|svc| (svc.key(), svc.clone())).collect();
        let _ = self.events.send(WatchEvent::Restarted(all));
    }

    pub fn watchers(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait::async_trait]
impl ServiceSource for MemorySource {
    async fn list(&self) -> Result<Vec<ServiceRecord>, SourceError> {
        if !self.reachable {
            return Err(SourceError::List("source unreachable".to_string()));
        }
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(services.values().cloned().collect())
    }

    async fn watch(&self) -> Result<WatchStream, SourceError> {
        if !self.reachable {
            return Err(SourceError::Watch("source unreachable".to_string()));
        }
        // subscribe before taking the snapshot; a change seen in both is applied twice, harmlessly
        let rx = self.events.subscribe();
        let snapshot = {
            let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
            WatchEvent::Restarted(services.values().cloned().collect())
        };
        let changes = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Some((Err(SourceError::Stream(format!("watch lagged, {} events dropped", n))), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(futures::stream::once(futures::future::ready(Ok(snapshot))).chain(changes).boxed())
    }
}
