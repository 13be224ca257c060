use std::collections::HashMap;

use agent_protocol::{ContextId, FormRender, MessageId, Part, TaskId};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::schema::{Message, MessageStatus, Role, Task, TaskState};

/// Read-only copy of every task, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
}

impl StoreSnapshot {
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == task_id)
    }
}

/// In-memory task and message store.
///
/// Messages are append-only. An agent message accepts part changes only while
/// it is `in-progress`; once finalized it is immutable.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
    index_by_id: HashMap<TaskId, usize>,
}

impl TaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new_message_id() -> MessageId {
        MessageId::new(Uuid::new_v4().to_string())
    }

    /// Creates a task under a fresh local id and returns that id.
    pub fn create_task(&mut self, context_id: ContextId) -> TaskId {
        let task_id = TaskId::new(Uuid::new_v4().to_string());
        self.index_by_id.insert(task_id.clone(), self.tasks.len());
        self.tasks.push(Task::new(task_id.clone(), context_id));
        task_id
    }

    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.index_by_id
            .get(task_id)
            .and_then(|index| self.tasks.get(*index))
    }

    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks: self.tasks.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.index_by_id.clear();
    }

    pub fn append_message(&mut self, task_id: &TaskId, mut message: Message) -> Result<(), StoreError> {
        let task = self.task_mut(task_id)?;
        message.task_id = Some(task.id.clone());
        task.messages.push(message);
        Ok(())
    }

    pub fn set_state(&mut self, task_id: &TaskId, state: TaskState) -> Result<(), StoreError> {
        self.task_mut(task_id)?.state = state;
        Ok(())
    }

    pub fn set_pending_form(
        &mut self,
        task_id: &TaskId,
        form: Option<FormRender>,
    ) -> Result<(), StoreError> {
        self.task_mut(task_id)?.pending_form = form;
        Ok(())
    }

    /// Returns the task waiting on the form with `form_id`, most recent first.
    #[must_use]
    pub fn task_awaiting_form(&self, form_id: &str) -> Option<&Task> {
        self.tasks.iter().rev().find(|task| {
            task.state == TaskState::InputRequired
                && task
                    .pending_form
                    .as_ref()
                    .is_some_and(|form| form.id == form_id)
        })
    }

    #[must_use]
    pub fn has_pending_forms(&self) -> bool {
        self.tasks.iter().any(|task| task.pending_form.is_some())
    }

    /// Replaces the local id of a task with the id the agent assigned.
    ///
    /// Messages already attached to the task follow it.
    pub fn rename_task(&mut self, task_id: &TaskId, new_id: TaskId) -> Result<(), StoreError> {
        if task_id == &new_id {
            return Ok(());
        }
        if self.index_by_id.contains_key(&new_id) {
            return Err(StoreError::TaskIdConflict { task_id: new_id });
        }

        let index = self
            .index_by_id
            .remove(task_id)
            .ok_or_else(|| StoreError::unknown_task(task_id))?;
        let task = &mut self.tasks[index];
        task.id = new_id.clone();
        for message in &mut task.messages {
            message.task_id = Some(new_id.clone());
        }
        self.index_by_id.insert(new_id, index);
        Ok(())
    }

    /// Overwrites the parts of an open agent message.
    pub fn set_agent_parts(
        &mut self,
        task_id: &TaskId,
        message_id: &MessageId,
        parts: Vec<Part>,
    ) -> Result<(), StoreError> {
        self.open_agent_message(task_id, message_id)?.parts = parts;
        Ok(())
    }

    pub fn push_agent_part(
        &mut self,
        task_id: &TaskId,
        message_id: &MessageId,
        part: Part,
    ) -> Result<(), StoreError> {
        self.open_agent_message(task_id, message_id)?.parts.push(part);
        Ok(())
    }

    /// Moves an open agent message to a terminal status.
    pub fn finalize_message(
        &mut self,
        task_id: &TaskId,
        message_id: &MessageId,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let message = self.open_agent_message(task_id, message_id)?;
        message.status = Some(status);
        if error.is_some() {
            message.error = error;
        }
        Ok(())
    }

    fn task_mut(&mut self, task_id: &TaskId) -> Result<&mut Task, StoreError> {
        let index = *self
            .index_by_id
            .get(task_id)
            .ok_or_else(|| StoreError::unknown_task(task_id))?;
        Ok(&mut self.tasks[index])
    }

    fn open_agent_message(
        &mut self,
        task_id: &TaskId,
        message_id: &MessageId,
    ) -> Result<&mut Message, StoreError> {
        let task = self.task_mut(task_id)?;
        let message = task
            .messages
            .iter_mut()
            .rev()
            .find(|message| &message.id == message_id)
            .ok_or_else(|| StoreError::unknown_message(task_id, message_id))?;

        if message.role != Role::Agent {
            return Err(StoreError::WrongRole {
                message_id: message_id.clone(),
                expected: Role::Agent,
                found: message.role,
            });
        }
        if let Some(status) = message.status.filter(|status| status.is_terminal()) {
            return Err(StoreError::MessageFinalized {
                message_id: message_id.clone(),
                status,
            });
        }
        Ok(message)
    }
}
