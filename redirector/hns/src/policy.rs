use crate::{gateway, Endpoint, Gateway, LocateError, Locator, Transport};
use metadata_redirector_core::{Backoff, Redirect};
use std::{
    net::{AddrParseError, IpAddr},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, instrument};

/// Applies and removes the metadata redirect for individual pods.
#[async_trait::async_trait]
pub trait PodRoutes: Send + Sync {
    async fn apply(&self, pod_ip: &str) -> Result<(), PolicyError>;

    async fn remove(&self, pod_ip: &str) -> Result<(), PolicyError>;
}

#[async_trait::async_trait]
impl<R: PodRoutes + ?Sized> PodRoutes for Arc<R> {
    async fn apply(&self, pod_ip: &str) -> Result<(), PolicyError> {
        (**self).apply(pod_ip).await
    }

    async fn remove(&self, pod_ip: &str) -> Result<(), PolicyError> {
        (**self).remove(pod_ip).await
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pod has no endpoint (yet). Benign.
    NotFound,
    /// The service could not be queried.
    InvalidOperation,
    /// The endpoint could not be updated.
    Unknown,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("missing IP address")]
    MissingIp,

    #[error("invalid pod IP {ip:?}: {source}")]
    InvalidIp {
        ip: String,
        #[source]
        source: AddrParseError,
    },

    #[error("no endpoint found for pod IP {0}")]
    NotFound(IpAddr),

    #[error("failed to get endpoint for pod IP {ip}: {source}")]
    InvalidOperation {
        ip: IpAddr,
        #[source]
        source: gateway::Error,
    },

    #[error("failed to update policy for pod IP {ip} on endpoint {endpoint}: {source}")]
    Unknown {
        ip: IpAddr,
        endpoint: String,
        #[source]
        source: gateway::Error,
    },
}

/// Rewrites an endpoint's policy list and submits it.
pub struct Editor<T> {
    gateway: Gateway<T>,
}

/// Locates pod endpoints and edits their redirect policy.
pub struct RoutePolicy<T> {
    locator: Locator<T>,
    editor: Editor<T>,
    redirect: Redirect,
}

// === impl PolicyError ===

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingIp | Self::InvalidIp { .. } | Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}

// === impl Editor ===

impl<T> Clone for Editor<T> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
        }
    }
}

impl<T: Transport> Editor<T> {
    pub fn new(gateway: Gateway<T>) -> Self {
        Self { gateway }
    }

    pub async fn apply(
        &self,
        mut endpoint: Endpoint,
        redirect: &Redirect,
    ) -> Result<(), gateway::Error> {
        endpoint.upsert_redirect(redirect);
        info!(id = %endpoint.id, "Adding policy to endpoint");
        self.gateway.modify_endpoint(&endpoint).await
    }

    pub async fn remove(
        &self,
        mut endpoint: Endpoint,
        target: IpAddr,
    ) -> Result<(), gateway::Error> {
        endpoint.remove_redirect(target);
        info!(id = %endpoint.id, "Deleting policy from endpoint");
        self.gateway.modify_endpoint(&endpoint).await
    }
}

// === impl RoutePolicy ===

impl<T> Clone for RoutePolicy<T> {
    fn clone(&self) -> Self {
        Self {
            locator: self.locator.clone(),
            editor: self.editor.clone(),
            redirect: self.redirect,
        }
    }
}

impl<T: Transport> RoutePolicy<T> {
    /// Builds a route policy whose gateway and locator each use `backoff` independently.
    pub fn new(gateway: Gateway<T>, backoff: Backoff, redirect: Redirect) -> Self {
        Self {
            locator: Locator::new(gateway.clone(), backoff),
            editor: Editor::new(gateway),
            redirect,
        }
    }

    async fn locate(&self, pod_ip: &str) -> Result<(IpAddr, Endpoint), PolicyError> {
        if pod_ip.is_empty() {
            return Err(PolicyError::MissingIp);
        }
        let ip = pod_ip.parse::<IpAddr>().map_err(|source| PolicyError::InvalidIp {
            ip: pod_ip.to_string(),
            source,
        })?;
        match self.locator.locate(ip).await {
            Ok(endpoint) => Ok((ip, endpoint)),
            Err(LocateError::NotFound(ip)) => Err(PolicyError::NotFound(ip)),
            Err(LocateError::InvalidOperation(source)) => {
                Err(PolicyError::InvalidOperation { ip, source })
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> PodRoutes for RoutePolicy<T> {
    #[instrument(skip(self))]
    async fn apply(&self, pod_ip: &str) -> Result<(), PolicyError> {
        let (ip, endpoint) = self.locate(pod_ip).await?;
        let id = endpoint.id.clone();
        self.editor
            .apply(endpoint, &self.redirect)
            .await
            .map_err(|source| PolicyError::Unknown {
                ip,
                endpoint: id,
                source,
            })
    }

    #[instrument(skip(self))]
    async fn remove(&self, pod_ip: &str) -> Result<(), PolicyError> {
        let (ip, endpoint) = self.locate(pod_ip).await?;
        let id = endpoint.id.clone();
        self.editor
            .remove(endpoint, self.redirect.metadata.ip())
            .await
            .map_err(|source| PolicyError::Unknown {
                ip,
                endpoint: id,
                source,
            })
    }
}
