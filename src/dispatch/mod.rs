//! Transport-independent building blocks of the dispatch layer.

pub mod dedup;
pub mod pool;
pub mod reply;

pub use dedup::{DedupEntry, DeduplicationRegistry, InFlightGuard};
pub use pool::{PoolStats, WorkerPool};
pub use reply::{ReplyChannel, ReplyDestination, ReplyPublisher};

use crate::envelope::{self, Protocol, ResponseEnvelope};
use crate::handler::RequestHandler;
use std::sync::Arc;

/// What the dispatch loop decided for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Connection is closing; the message was left for redelivery.
    Dropped,
    /// Negative-acknowledged without requeue (duplicate or unroutable).
    Rejected,
    /// Could not read a correlation id.
    Malformed,
    /// Pool saturated; a 429 reply was published instead.
    Overloaded,
    /// Handed to a pool worker.
    Submitted,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::Rejected => "rejected",
            Self::Malformed => "malformed",
            Self::Overloaded => "overloaded",
            Self::Submitted => "submitted",
        }
    }
}

/// Encode `response` for `protocol` and publish it, logging any failure.
///
/// Returns whether the reply reached the transport.
pub async fn publish_response(
    replies: &ReplyChannel,
    response: &ResponseEnvelope,
    protocol: Protocol,
    destination: &ReplyDestination,
) -> bool {
    let payload = match envelope::encode(response, protocol) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(
                request_id = %response.request_id,
                %protocol,
                "Failed to encode reply: {e}"
            );
            return false;
        }
    };

    match replies.publish(payload, destination).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                request_id = %response.request_id,
                %destination,
                "Reply not delivered: {e}"
            );
            false
        }
    }
}

/// Worker body shared by both transports: decode, handle, encode, publish.
///
/// No deadline is applied to `handler`; a call that never returns keeps its
/// pool slot for the life of the process.
pub async fn process_request(
    raw: Vec<u8>,
    request_id: String,
    protocol: Protocol,
    handler: Arc<dyn RequestHandler>,
    replies: Arc<ReplyChannel>,
    destination: ReplyDestination,
) {
    let response = match envelope::decode(&raw, protocol) {
        Ok(request) => {
            tracing::debug!(
                request_id = %request.request_id,
                method = %request.method,
                path = %request.path,
                "Handling request"
            );
            handler.handle(request).await
        }
        Err(e) => {
            tracing::warn!(%request_id, %protocol, "Rejecting malformed request: {e}");
            e.to_response(&request_id)
        }
    };

    tracing::info!(
        %request_id,
        status = response.status_code,
        "Request processed"
    );
    publish_response(&replies, &response, protocol, &destination).await;
}
