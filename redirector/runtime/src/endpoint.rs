use crate::{
    metrics::Metrics,
    redirector::{Redirector, GRACE_PERIOD},
};
use anyhow::Result;
use metadata_redirector_core::Exit;
use metadata_redirector_hns::{ErrorKind, PodRoutes};
use metadata_redirector_k8s::{self as k8s, Pod, PodEvent, PodSource, ResourceExt, Scope};
use std::collections::HashMap;
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info, instrument, warn};

/// The delay before a full reconciliation after a failed update.
pub const SELF_HEAL_DELAY: time::Duration = time::Duration::from_secs(10);

/// Redirects each pod individually by attaching a proxy policy to its network endpoint.
pub struct EndpointRedirector<R, S> {
    routes: R,
    pods: S,
    events: mpsc::UnboundedReceiver<PodEvent>,
    scope: Scope,
    metrics: Metrics,

    /// Pod UID to the IP its policy was applied for.
    applied: HashMap<String, String>,
}

// === impl EndpointRedirector ===

impl<R: PodRoutes, S: PodSource> EndpointRedirector<R, S> {
    pub fn new(
        routes: R,
        pods: S,
        events: mpsc::UnboundedReceiver<PodEvent>,
        scope: Scope,
        metrics: Metrics,
    ) -> Self {
        Self {
            routes,
            pods,
            events,
            scope,
            metrics,
            applied: HashMap::new(),
        }
    }

    async fn apply(&mut self, pod: &Pod, ip: &str) -> Result<(), ErrorKind> {
        let node = self.scope.node_name();
        self.metrics.apply_attempted(ip, node);
        match self.routes.apply(ip).await {
            Ok(()) => {
                info!(pod = %pod.name_any(), %ip, "Applied redirect policy");
                if let Some(uid) = pod.uid() {
                    self.applied.insert(uid, ip.to_string());
                }
                Ok(())
            }
            Err(error) => {
                let kind = error.kind();
                if kind == ErrorKind::NotFound {
                    // The endpoint has not been created yet.
                    info!(pod = %pod.name_any(), %error, "Pod endpoint not found");
                } else {
                    self.metrics.apply_failed(ip, node);
                    warn!(pod = %pod.name_any(), %error, "Failed to apply redirect policy");
                }
                Err(kind)
            }
        }
    }

    async fn remove(&self, pod: &Pod, ip: &str) {
        match self.routes.remove(ip).await {
            Ok(()) => info!(pod = %pod.name_any(), %ip, "Removed redirect policy"),
            Err(error) => {
                warn!(pod = %pod.name_any(), %ip, %error, "Failed to remove redirect policy")
            }
        }
    }

    async fn applied(&mut self, pod: Pod) {
        let Some(ip) = self.scope.pod_ip(&pod).map(String::from) else {
            debug!(pod = %pod.name_any(), "Ignoring pod out of scope");
            return;
        };

        if let Some(uid) = pod.uid() {
            if let Some(old) = self.applied.get(&uid).filter(|old| **old != ip).cloned() {
                info!(pod = %pod.name_any(), %old, new = %ip, "Pod IP changed");
                self.remove(&pod, &old).await;
                self.applied.remove(&uid);
            }
        }

        match self.apply(&pod, &ip).await {
            Ok(()) | Err(ErrorKind::NotFound) => {}
            Err(_) => self.self_heal().await,
        }
    }

    async fn deleted(&mut self, pod: Pod) {
        let recorded = pod.uid().and_then(|uid| self.applied.remove(&uid));
        let Some(ip) = recorded.or_else(|| self.scope.pod_ip(&pod).map(String::from)) else {
            return;
        };
        self.remove(&pod, &ip).await;
    }

    async fn self_heal(&mut self) {
        info!(delay = ?SELF_HEAL_DELAY, "Reconciling all pods after failure");
        time::sleep(SELF_HEAL_DELAY).await;
        self.reconcile_pods().await;
    }

    #[instrument(skip(self))]
    async fn reconcile_pods(&mut self) {
        let pods = match self.pods.list_pods().await {
            Ok(pods) => pods,
            Err(error) => {
                warn!(%error, "Failed to list pods");
                return;
            }
        };

        for pod in &pods {
            if let Some(ip) = self.scope.pod_ip(pod).map(String::from) {
                let _ = self.apply(pod, &ip).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl<R: PodRoutes, S: PodSource> Redirector for EndpointRedirector<R, S> {
    type Update = PodEvent;

    async fn start(&mut self) -> Result<()> {
        self.reconcile_pods().await;
        Ok(())
    }

    async fn next(&mut self) -> Option<PodEvent> {
        self.events.recv().await
    }

    async fn sync(&mut self, event: PodEvent) {
        match event {
            PodEvent::Applied(pod) => self.applied(pod).await,
            PodEvent::Deleted(pod) => self.deleted(pod).await,
        }
    }

    async fn reconcile_all(&mut self) {
        self.reconcile_pods().await
    }

    #[instrument(skip(self))]
    async fn teardown(&mut self) -> Exit {
        let exit = match self.pods.list_pods().await {
            Ok(pods) => {
                for pod in pods.iter().filter(|p| self.scope.on_node(p)) {
                    let ip = k8s::pod_ip(pod).unwrap_or_default();
                    self.remove(pod, ip).await;
                }
                self.applied.clear();
                Exit::Success
            }
            Err(error) => {
                error!(%error, "Failed to list pods; redirect policies were not removed");
                Exit::Failure
            }
        };

        info!(grace = ?GRACE_PERIOD, "Waiting for connections to complete");
        time::sleep(GRACE_PERIOD).await;
        exit
    }
}
