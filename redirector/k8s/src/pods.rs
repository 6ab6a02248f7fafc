use crate::{Pod, Scope};
use anyhow::Result;
use futures::prelude::*;
use kube::{
    api::{Api, ListParams},
    runtime::watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A change to a pod scheduled to this node.
#[derive(Clone, Debug)]
pub enum PodEvent {
    Applied(Pod),
    Deleted(Pod),
}

/// Lists the pods scheduled to this node.
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<Pod>>;
}

#[async_trait::async_trait]
impl<S: PodSource + ?Sized> PodSource for std::sync::Arc<S> {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        (**self).list_pods().await
    }
}

/// Lists pods through the Kubernetes API.
#[derive(Clone)]
pub struct PodLister {
    api: Api<Pod>,
    params: ListParams,
}

// === impl PodLister ===

impl PodLister {
    pub fn new(client: kube::Client, scope: &Scope) -> Self {
        Self {
            api: Api::all(client),
            params: ListParams::default().fields(&scope.field_selector()),
        }
    }
}

#[async_trait::async_trait]
impl PodSource for PodLister {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let pods = self.api.list(&self.params).await?;
        debug!(pods = pods.items.len(), "Listed pods");
        Ok(pods.items)
    }
}

/// Forwards a pod watch to the reconciler until either the watch ends or the reconciler stops
/// receiving.
pub async fn forward(
    events: impl Stream<Item = watcher::Event<Pod>>,
    tx: mpsc::UnboundedSender<PodEvent>,
) {
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        let ev = match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                PodEvent::Applied(pod)
            }
            watcher::Event::Delete(pod) => PodEvent::Deleted(pod),
            watcher::Event::Init => {
                debug!("Pod watch (re)started");
                continue;
            }
            watcher::Event::InitDone => {
                debug!("Pod watch synced");
                continue;
            }
        };
        if tx.send(ev).is_err() {
            info!("Reconciler stopped; ending pod watch");
            return;
        }
    }
    info!("Pod watch ended");
}
