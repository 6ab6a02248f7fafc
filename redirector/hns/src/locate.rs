use crate::{gateway, Endpoint, Gateway, Transport};
use metadata_redirector_core::Backoff;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, instrument};

/// Finds the endpoint that holds a pod IP.
///
/// A pod's endpoint may not be visible to the service until shortly after the pod is created,
/// so a missing endpoint is retried with its own backoff, independent of the gateway's.
pub struct Locator<T> {
    gateway: Gateway<T>,
    backoff: Backoff,
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no endpoint found for IP {0}")]
    NotFound(IpAddr),

    #[error(transparent)]
    InvalidOperation(gateway::Error),
}

// === impl Locator ===

impl<T> Clone for Locator<T> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            backoff: self.backoff,
        }
    }
}

impl<T: Transport> Locator<T> {
    pub fn new(gateway: Gateway<T>, backoff: Backoff) -> Self {
        Self { gateway, backoff }
    }

    #[instrument(skip(self))]
    pub async fn locate(&self, ip: IpAddr) -> Result<Endpoint, LocateError> {
        let gateway = &self.gateway;
        let endpoint = self
            .backoff
            .retry_if(
                "endpoint lookup",
                || async move {
                    let endpoints = gateway
                        .enumerate_endpoints()
                        .await
                        .map_err(LocateError::InvalidOperation)?;
                    endpoints
                        .into_iter()
                        .find(|ep| ep.ip() == Some(ip))
                        .ok_or(LocateError::NotFound(ip))
                },
                |error| matches!(error, LocateError::NotFound(_)),
            )
            .await?;
        debug!(id = %endpoint.id, "Found endpoint");
        Ok(endpoint)
    }
}
