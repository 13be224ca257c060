use agent_protocol::{MessageId, TaskId};
use thiserror::Error;

use crate::schema::{MessageStatus, Role};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown task '{task_id}'")]
    UnknownTask { task_id: TaskId },

    #[error("task '{task_id}' has no message '{message_id}'")]
    UnknownMessage {
        task_id: TaskId,
        message_id: MessageId,
    },

    #[error("message '{message_id}' is already {status} and can no longer change")]
    MessageFinalized {
        message_id: MessageId,
        status: MessageStatus,
    },

    #[error("message '{message_id}' is a {found} message; expected {expected}")]
    WrongRole {
        message_id: MessageId,
        expected: Role,
        found: Role,
    },

    #[error("task id '{task_id}' is already in use")]
    TaskIdConflict { task_id: TaskId },
}

impl StoreError {
    #[must_use]
    pub fn unknown_task(task_id: &TaskId) -> Self {
        Self::UnknownTask {
            task_id: task_id.clone(),
        }
    }

    #[must_use]
    pub fn unknown_message(task_id: &TaskId, message_id: &MessageId) -> Self {
        Self::UnknownMessage {
            task_id: task_id.clone(),
            message_id: message_id.clone(),
        }
    }
}
