use crate::{error::TransportError, types::SendAck};

/// Send request result before it is applied to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and produced an event ID.
    Success { event_id: String },
    /// Send failed with transport error details.
    Failure { error: TransportError },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<Result<String, TransportError>> for SendOutcome {
    fn from(result: Result<String, TransportError>) -> Self {
        match result {
            Ok(event_id) => Self::Success { event_id },
            Err(error) => Self::Failure { error },
        }
    }
}

/// Convert a send outcome to a stable [`SendAck`].
pub fn normalize_send_outcome(transaction_id: impl Into<String>, outcome: &SendOutcome) -> SendAck {
    let transaction_id = transaction_id.into();
    match outcome {
        SendOutcome::Success { event_id } => SendAck {
            transaction_id,
            event_id: Some(event_id.clone()),
            error_code: None,
        },
        SendOutcome::Failure { error } => SendAck {
            transaction_id,
            event_id: None,
            error_code: Some(error.code.clone()),
        },
    }
}
