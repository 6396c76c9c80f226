use tokio::task::JoinHandle;
use timeline_core::{RecordKey, TimelineError, TransportError, TransportErrorCategory};

/// Handle to a send running in the background.
///
/// The local echo is already in the timeline when this handle is returned.
/// Dropping the handle does not cancel the send.
#[derive(Debug)]
pub struct PendingSend {
    transaction_id: String,
    key: RecordKey,
    task: JoinHandle<Result<String, TimelineError>>,
}

impl PendingSend {
    pub(crate) fn new(
        transaction_id: String,
        key: RecordKey,
        task: JoinHandle<Result<String, TimelineError>>,
    ) -> Self {
        Self {
            transaction_id,
            key,
            task,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Handle of the local echo record.
    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the transport's answer and return the server event ID.
    ///
    /// A failed send resolves to [`TimelineError::SendFailed`]; the record stays
    /// in the timeline as `NotSent`.
    pub async fn wait(self) -> Result<String, TimelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(TimelineError::Transport(TransportError::new(
                TransportErrorCategory::Internal,
                "send_task_failed",
                err.to_string(),
            ))),
        }
    }
}
