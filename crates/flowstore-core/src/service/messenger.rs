// Cluster messenger contract
// Node-to-node request/response used to forward work to a device master

use std::{marker::PhantomData, sync::Arc, time::Duration};

use tracing::{debug, error};

use flowstore_api::{ClusterRequest, MessageSubject};
use flowstore_common::{DeviceId, FlowStoreError, NodeId};

/// Messaging failures
#[derive(thiserror::Error, Debug)]
pub enum MessagingError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request '{subject}' to {target} timed out after {after:?}")]
    Timeout {
        target: NodeId,
        subject: MessageSubject,
        after: Duration,
    },

    #[error("node {target} has no handler for '{subject}'")]
    NoHandler {
        target: NodeId,
        subject: MessageSubject,
    },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl MessagingError {
    /// Convert into the store error surfaced for requests about `device_id`
    pub fn into_store_error(self, device_id: &DeviceId) -> FlowStoreError {
        match self {
            MessagingError::Timeout {
                target,
                subject,
                after,
            } => FlowStoreError::Timeout {
                target,
                subject: subject.to_string(),
                after,
            },
            MessagingError::Codec(msg) => FlowStoreError::Codec(msg),
            other => FlowStoreError::routing(device_id, other.to_string()),
        }
    }
}

impl From<FlowStoreError> for MessagingError {
    fn from(value: FlowStoreError) -> Self {
        match value {
            FlowStoreError::Codec(msg) => MessagingError::Codec(msg),
            other => MessagingError::Handler(other.to_string()),
        }
    }
}

/// Handler for inbound messages of one subject
#[async_trait::async_trait]
pub trait ClusterMessageHandler: Send + Sync {
    async fn handle(&self, sender: &NodeId, payload: &[u8]) -> Result<Vec<u8>, MessagingError>;
}

/// Request/response messaging between cluster nodes
#[async_trait::async_trait]
pub trait ClusterMessenger: Send + Sync {
    /// Identifier of the local node
    fn local_node(&self) -> &NodeId;

    /// Send a payload and wait for the response, bounded by `timeout`
    async fn send_and_await(
        &self,
        target: &NodeId,
        subject: MessageSubject,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, MessagingError>;

    /// Register the local handler for a subject, replacing any previous one
    fn subscribe(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>);

    /// Remove the local handler for a subject
    fn unsubscribe(&self, subject: MessageSubject);
}

/// Send a typed request and decode its typed response
pub async fn send_request<R: ClusterRequest>(
    messenger: &dyn ClusterMessenger,
    target: &NodeId,
    request: &R,
    timeout: Duration,
) -> Result<R::Response, MessagingError> {
    let payload = request.encode()?;
    debug!(
        target = %target,
        subject = %R::SUBJECT,
        bytes = payload.len(),
        "Sending cluster request"
    );
    let response = messenger
        .send_and_await(target, R::SUBJECT, payload, timeout)
        .await?;
    Ok(R::decode_response(&response)?)
}

/// Typed handler for one request type
#[async_trait::async_trait]
pub trait RequestHandler<R: ClusterRequest>: Send + Sync {
    async fn handle(&self, sender: &NodeId, request: R) -> R::Response;
}

/// Adapts a [`RequestHandler`] to the byte-level [`ClusterMessageHandler`]
pub struct TypedMessageHandler<R, H> {
    handler: H,
    _request: PhantomData<fn() -> R>,
}

impl<R, H> TypedMessageHandler<R, H>
where
    R: ClusterRequest,
    H: RequestHandler<R> + 'static,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _request: PhantomData,
        }
    }

    /// Wrap the handler for registration on a messenger
    pub fn shared(handler: H) -> Arc<dyn ClusterMessageHandler> {
        Arc::new(Self::new(handler))
    }
}

#[async_trait::async_trait]
impl<R, H> ClusterMessageHandler for TypedMessageHandler<R, H>
where
    R: ClusterRequest,
    H: RequestHandler<R> + 'static,
{
    async fn handle(&self, sender: &NodeId, payload: &[u8]) -> Result<Vec<u8>, MessagingError> {
        let request = R::decode(payload).map_err(|e| {
            error!(sender = %sender, subject = %R::SUBJECT, "Failed to decode request: {}", e);
            MessagingError::from(e)
        })?;
        let response = self.handler.handle(sender, request).await;
        Ok(R::encode_response(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_store_timeout() {
        let err = MessagingError::Timeout {
            target: NodeId::new("n1"),
            subject: MessageSubject::ApplyBatch,
            after: Duration::from_millis(100),
        };
        match err.into_store_error(&DeviceId::new("of:1")) {
            FlowStoreError::Timeout { subject, .. } => assert_eq!(subject, "APPLY_BATCH"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unreachable_maps_to_routing() {
        let err = MessagingError::Unreachable(NodeId::new("n1"));
        match err.into_store_error(&DeviceId::new("of:1")) {
            FlowStoreError::Routing { device, reason } => {
                assert_eq!(device, DeviceId::new("of:1"));
                assert!(reason.contains("unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
