//! Liveness reporting.
//!
//! The probe answers whether redirection is in effect: its body reflects whether the reconciler
//! has completed start-up and, for the endpoint strategy, its status reflects whether the host
//! network service is reachable. Unreachability optionally demotes the node with a taint.

use crate::metrics::Metrics;
use anyhow::Result;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use metadata_redirector_hns::{Endpoint, Gateway, Transport};
use metadata_redirector_k8s::{node, NodeMarker, PodSource, ResourceExt, Scope};
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, instrument, warn};

pub const PATH: &str = "/healthz";

#[async_trait::async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self) -> (StatusCode, &'static str);
}

/// Reports only whether start-up has completed.
#[derive(Clone, Debug)]
pub struct Minimal {
    initialized: watch::Receiver<bool>,
}

/// Checks the host network service and cross-checks pod policies.
pub struct Extended<T, S, M> {
    initialized: watch::Receiver<bool>,
    gateway: Gateway<T>,
    pods: S,
    marker: Option<M>,
    scope: Scope,
    metadata_ip: IpAddr,
    metrics: Metrics,
}

fn body(initialized: &watch::Receiver<bool>) -> &'static str {
    if *initialized.borrow() {
        "Active"
    } else {
        "Not Active"
    }
}

// === impl Minimal ===

impl Minimal {
    pub fn new(initialized: watch::Receiver<bool>) -> Self {
        Self { initialized }
    }
}

#[async_trait::async_trait]
impl Probe for Minimal {
    async fn probe(&self) -> (StatusCode, &'static str) {
        (StatusCode::OK, body(&self.initialized))
    }
}

// === impl Extended ===

impl<T, S, M> Extended<T, S, M>
where
    T: Transport,
    S: PodSource,
    M: NodeMarker,
{
    pub fn new(
        initialized: watch::Receiver<bool>,
        gateway: Gateway<T>,
        pods: S,
        marker: Option<M>,
        scope: Scope,
        metadata_ip: IpAddr,
        metrics: Metrics,
    ) -> Self {
        Self {
            initialized,
            gateway,
            pods,
            marker,
            scope,
            metadata_ip,
            metrics,
        }
    }

    /// Counts in-scope pods whose endpoint lacks the redirect. Nothing is repaired.
    async fn check_policies(&self, endpoints: &[Endpoint]) {
        let pods = match self.pods.list_pods().await {
            Ok(pods) => pods,
            Err(error) => {
                warn!(%error, "Failed to list pods for policy check");
                return;
            }
        };

        for pod in &pods {
            let Some(ip) = self.scope.pod_ip(pod) else {
                continue;
            };
            let endpoint = ip
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| endpoints.iter().find(|ep| ep.ip() == Some(ip)));
            match endpoint {
                None => {
                    info!(pod = %pod.name_any(), %ip, "No endpoint found for pod");
                }
                Some(ep) if !ep.has_redirect(self.metadata_ip) => {
                    warn!(
                        pod = %pod.name_any(),
                        %ip,
                        endpoint = %ep.id,
                        "Pod endpoint is missing its redirect policy"
                    );
                    self.metrics.mismatch(ip, self.scope.node_name());
                }
                Some(_) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, S, M> Probe for Extended<T, S, M>
where
    T: Transport,
    S: PodSource + 'static,
    M: NodeMarker + 'static,
{
    #[instrument(skip(self))]
    async fn probe(&self) -> (StatusCode, &'static str) {
        let body = body(&self.initialized);
        let node_name = self.scope.node_name();

        let endpoints = match self.gateway.enumerate_endpoints_once().await {
            Ok(endpoints) => endpoints,
            Err(error) => {
                warn!(%error, "Host network service is unavailable");
                if let Some(marker) = &self.marker {
                    if let Err(error) = node::mark_unschedulable(marker, node_name).await {
                        warn!(%error, "Failed to mark node unschedulable");
                    }
                }
                return (StatusCode::INTERNAL_SERVER_ERROR, body);
            }
        };

        if let Some(marker) = &self.marker {
            if let Err(error) = node::clear_unschedulable(marker, node_name).await {
                warn!(%error, "Failed to clear unschedulable mark");
            }
        }
        self.check_policies(&endpoints).await;

        (StatusCode::OK, body)
    }
}

// === server ===

/// Serves the probe over HTTP/1 until `drain` is signaled.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve<P: Probe>(addr: SocketAddr, probe: Arc<P>, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health probe server listening");

    let drained = drain.signaled();
    tokio::pin!(drained);
    loop {
        let (io, client) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _handle = &mut drained => {
                debug!("Health probe server shutting down");
                return Ok(());
            }
        };

        let probe = probe.clone();
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req| {
                let probe = probe.clone();
                async move { Ok::<_, Infallible>(handle(&*probe, req).await) }
            });
            if let Err(error) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(io), svc)
                .await
            {
                debug!(%error, %client, "Connection failed");
            }
        });
    }
}

async fn handle<P: Probe + ?Sized, B>(probe: &P, req: Request<B>) -> Response<Full<Bytes>> {
    if req.uri().path() != PATH {
        return respond(StatusCode::NOT_FOUND, "");
    }
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "");
    }
    let (status, body) = probe.probe().await;
    respond(status, body)
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    rsp
}

#[cfg(test)]
mod tests;
