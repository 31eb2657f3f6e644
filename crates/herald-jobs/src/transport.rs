//! The seam between the engine and the messaging platform.

use crate::job::{Destination, FailureReason, MessageHandle, Payload};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of one send call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(MessageHandle),
    /// The platform asked to wait before retrying this destination.
    Throttled(Duration),
    /// Network failure or platform error without a wait hint.
    Unavailable(String),
    /// Retrying will not help (unauthorized, chat not found, bad content).
    PermanentFailure(FailureReason),
}

/// Result of one delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The message no longer exists; counts as success.
    AlreadyGone,
    Throttled(Duration),
    Unavailable(String),
    PermanentFailure(FailureReason),
}

/// Delivers and deletes messages on a platform.
///
/// Implementations must not retry internally; the dispatcher owns retries
/// and rate limiting.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &Destination, payload: &Payload) -> SendOutcome;

    async fn delete(&self, destination: &Destination, handle: &MessageHandle) -> DeleteOutcome;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, destination: &Destination, payload: &Payload) -> SendOutcome {
        (**self).send(destination, payload).await
    }

    async fn delete(&self, destination: &Destination, handle: &MessageHandle) -> DeleteOutcome {
        (**self).delete(destination, handle).await
    }
}
