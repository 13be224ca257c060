use agent_protocol::{FormError, FulfillmentError, TaskId, TransportError};
use task_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("a run is already in progress for task '{task_id}'")]
    RunInProgress { task_id: TaskId },

    #[error("no run is in progress")]
    NoRunInProgress,

    #[error("nothing to send: input has no text, attachments, or form response")]
    EmptyInput,

    #[error("unknown task '{task_id}'")]
    TaskNotFound { task_id: TaskId },

    #[error("form response '{found}' does not answer pending form '{expected}'")]
    FormMismatch { expected: String, found: String },

    #[error("no task is waiting for form '{form_id}'")]
    NoPendingForm { form_id: String },

    #[error("invalid form response: {0}")]
    InvalidForm(#[from] FormError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fulfillment(#[from] FulfillmentError),

    #[error("task store rejected update: {0}")]
    Store(#[from] StoreError),
}

impl RunError {
    #[must_use]
    pub fn run_in_progress(task_id: &TaskId) -> Self {
        Self::RunInProgress {
            task_id: task_id.clone(),
        }
    }

    /// Returns true when the request was refused before any state changed.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RunInProgress { .. }
                | Self::NoRunInProgress
                | Self::EmptyInput
                | Self::TaskNotFound { .. }
                | Self::FormMismatch { .. }
                | Self::NoPendingForm { .. }
                | Self::InvalidForm(_)
        )
    }
}
