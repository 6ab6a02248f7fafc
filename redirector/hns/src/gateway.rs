use crate::Endpoint;
use metadata_redirector_core::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// A raw request/response exchange with the host network service.
///
/// Implementations report every failure, including I/O failures, through
/// [`Response::error`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn invoke(&self, req: Request) -> Response;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    EndpointV1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Enumerate,
    Modify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub entity: Entity,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Backend(String),

    #[error("failed to encode endpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode endpoints: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Issues requests to the host network service, retrying failed calls.
///
/// Retry state is scoped to each request, so a gateway may be cloned and used concurrently.
#[derive(Debug)]
pub struct Gateway<T> {
    transport: Arc<T>,
    backoff: Backoff,
}

// === impl Request ===

impl Request {
    pub fn enumerate(entity: Entity) -> Self {
        Self {
            entity,
            operation: Operation::Enumerate,
            request: None,
        }
    }

    pub fn modify(entity: Entity, request: Value) -> Self {
        Self {
            entity,
            operation: Operation::Modify,
            request: Some(request),
        }
    }
}

// === impl Response ===

impl Response {
    pub fn ok(response: Value) -> Self {
        Self {
            error: None,
            response,
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            response: Value::Null,
        }
    }

    fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(error) => Err(Error::Backend(error)),
            None => Ok(self.response),
        }
    }
}

// === impl Gateway ===

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            backoff: self.backoff,
        }
    }
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: Arc<T>, backoff: Backoff) -> Self {
        Self { transport, backoff }
    }

    /// Sends `req`, retrying on any error until the backoff is exhausted.
    pub async fn invoke(&self, req: Request) -> Result<Value, Error> {
        self.backoff
            .retry("host network service call", || self.invoke_once(req.clone()))
            .await
    }

    /// Sends `req` exactly once.
    pub async fn invoke_once(&self, req: Request) -> Result<Value, Error> {
        debug!(entity = ?req.entity, operation = ?req.operation, "Calling host network service");
        let rsp = self.transport.invoke(req).await;
        trace!(?rsp);
        rsp.into_result()
    }

    pub async fn enumerate_endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let rsp = self.invoke(Request::enumerate(Entity::EndpointV1)).await?;
        decode_endpoints(rsp)
    }

    /// Enumerates endpoints without retrying, for callers that must answer promptly.
    pub async fn enumerate_endpoints_once(&self) -> Result<Vec<Endpoint>, Error> {
        let rsp = self
            .invoke_once(Request::enumerate(Entity::EndpointV1))
            .await?;
        decode_endpoints(rsp)
    }

    /// Submits the whole endpoint, replacing the service's copy.
    pub async fn modify_endpoint(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let body = serde_json::to_value(endpoint).map_err(Error::Encode)?;
        self.invoke(Request::modify(Entity::EndpointV1, body))
            .await
            .map(|_| ())
    }
}

fn decode_endpoints(rsp: Value) -> Result<Vec<Endpoint>, Error> {
    if rsp.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(rsp).map_err(Error::Decode)
}
