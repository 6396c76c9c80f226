use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category of a transport failure, used for retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorCategory {
    /// Invalid input or unsupported request.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or server failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// Response could not be decoded.
    Serialization,
    /// Bug or invariant break in the transport.
    Internal,
}

/// Stable error payload reported by transport collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct TransportError {
    /// High-level error category.
    pub category: TransportErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl TransportError {
    pub fn new(
        category: TransportErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            TransportErrorCategory::Network | TransportErrorCategory::RateLimited
        )
    }
}

/// Errors and skip reasons produced by the timeline engine.
///
/// `DuplicateEvent` and `MalformedEvent` never abort a batch; they are
/// collected in the batch report instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// An event with this ID is already in the timeline.
    #[error("event '{0}' is already in the timeline")]
    DuplicateEvent(String),
    /// An event is missing required fields.
    #[error("malformed event {}: {reason}", .event_id.as_deref().unwrap_or("<no id>"))]
    MalformedEvent {
        event_id: Option<String>,
        reason: String,
    },
    /// The transaction ID was already used for a local echo in this room.
    #[error("transaction '{0}' was already used in this room")]
    DuplicateTransaction(String),
    /// No local echo in the required state exists for this transaction.
    #[error("transaction '{0}' has no matching local echo")]
    UnknownTransaction(String),
    /// The transport rejected a send.
    #[error("send for transaction '{transaction_id}' failed: {error}")]
    SendFailed {
        transaction_id: String,
        #[source]
        error: TransportError,
    },
    /// A live batch carried no events.
    #[error("event batch is empty")]
    EmptyBatch,
    /// A transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_recoverable() {
        let err = TransportError::new(TransportErrorCategory::RateLimited, "rate_limited", "wait");
        assert!(err.is_recoverable());
        assert_eq!(err.retry_after_ms, None);
    }

    #[test]
    fn auth_failures_are_not_recoverable() {
        let err = TransportError::new(TransportErrorCategory::Auth, "forbidden", "no");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn malformed_event_message_names_the_event() {
        let err = TimelineError::MalformedEvent {
            event_id: None,
            reason: "missing sender".into(),
        };
        assert_eq!(err.to_string(), "malformed event <no id>: missing sender");
    }
}
