//! Services read from the Kubernetes API across all namespaces.

use super::source::{ServiceRecord, ServiceSource, SourceError, WatchEvent, WatchStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::OnceCell;

/// The client is created on first use from the local kubeconfig or the in-cluster
/// service account, so building the plugin never touches the network.
#[derive(Default)]
pub struct KubeSource {
    api: OnceCell<Api<Service>>,
}

impl KubeSource {
    pub fn new() -> Self {
        Self { api: OnceCell::new() }
    }

    async fn api(&self) -> Result<&Api<Service>, SourceError> {
        self.api
            .get_or_try_init(|| async {
                let client = Client::try_default().await.map_err(|e| SourceError::Client(e.to_string()))?;
                tracing::info!("[kubeloadbalancer] Connected to Kubernetes API");
                Ok(Api::all(client))
            })
            .await
    }
}

fn to_record(svc: &Service) -> Option<ServiceRecord> {
    let name = svc.metadata.name.clone()?;
    let namespace = svc.metadata.namespace.clone().unwrap_or_default();
    let ingress = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|list| list.iter().filter_map(|ing| ing.ip.clone()).collect())
        .unwrap_or_default();
    Some(ServiceRecord { name, namespace, ingress })
}

fn to_event(event: Result<watcher::Event<Service>, watcher::Error>) -> Option<Result<WatchEvent, SourceError>> {
    match event {
        Ok(watcher::Event::Applied(svc)) => to_record(&svc).map(|r| Ok(WatchEvent::Applied(r))),
        Ok(watcher::Event::Deleted(svc)) => to_record(&svc).map(|r| Ok(WatchEvent::Deleted(r))),
        Ok(watcher::Event::Restarted(all)) => Some(Ok(WatchEvent::Restarted(all.iter().filter_map(to_record).collect()))),
        Err(e) => Some(Err(SourceError::Stream(e.to_string()))),
    }
}

#[async_trait::async_trait]
impl ServiceSource for KubeSource {
    async fn list(&self) -> Result<Vec<ServiceRecord>, SourceError> {
        let api = self.api().await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| SourceError::List(e.to_string()))?;
        Ok(list.items.iter().filter_map(to_record).collect())
    }

    async fn watch(&self) -> Result<WatchStream, SourceError> {
        let api = self.api().await.map_err(|e| SourceError::Watch(e.to_string()))?.clone();
        // the watcher re-lists and re-watches on its own, backing off between failures
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| futures::future::ready(to_event(event)));
        Ok(stream.boxed())
    }
}
