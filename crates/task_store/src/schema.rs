use std::fmt;

use agent_protocol::{ContextId, FormRender, FormResponse, MessageId, Part, TaskId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    #[default]
    Unknown,
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Agent => "agent",
        })
    }
}

/// Lifecycle of an agent message. Every status except `InProgress` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    InProgress,
    Completed,
    InputRequired,
    Aborted,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::InputRequired => "input-required",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        })
    }
}

/// Form answered by a user message, kept with the definition it answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageForm {
    pub request: FormRender,
    pub response: FormResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<MessageForm>,
}

impl Message {
    #[must_use]
    pub fn user(id: MessageId, parts: Vec<Part>, form: Option<MessageForm>) -> Self {
        Self {
            id,
            role: Role::User,
            parts,
            error: None,
            task_id: None,
            status: None,
            form,
        }
    }

    /// Empty agent message that collects a run's streamed parts.
    #[must_use]
    pub fn agent_placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Agent,
            parts: Vec::new(),
            error: None,
            task_id: None,
            status: Some(MessageStatus::InProgress),
            form: None,
        }
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.status.is_some_and(MessageStatus::is_terminal)
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub context_id: ContextId,
    pub messages: Vec<Message>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_form: Option<FormRender>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Task {
    #[must_use]
    pub fn new(id: TaskId, context_id: ContextId) -> Self {
        Self {
            id,
            context_id,
            messages: Vec::new(),
            state: TaskState::Unknown,
            pending_form: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    #[must_use]
    pub fn last_agent_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Agent)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn lifecycle_enums_use_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(TaskState::InputRequired).expect("serialize"),
            json!("input-required")
        );
        assert_eq!(
            serde_json::to_value(MessageStatus::InProgress).expect("serialize"),
            json!("in-progress")
        );
        assert_eq!(TaskState::Canceled.to_string(), "canceled");
        assert_eq!(MessageStatus::Aborted.to_string(), "aborted");
    }

    #[test]
    fn placeholder_is_open_until_a_terminal_status() {
        let mut message = Message::agent_placeholder(MessageId::new("m"));
        assert!(!message.is_finalized());
        message.status = Some(MessageStatus::InputRequired);
        assert!(message.is_finalized());

        let user = Message::user(MessageId::new("u"), vec![Part::text("p", "hi")], None);
        assert!(!user.is_finalized());
        assert_eq!(user.text(), "hi");
    }

    #[test]
    fn task_serializes_created_at_as_rfc3339() {
        let task = Task::new(TaskId::new("task-1"), ContextId::new("ctx"));
        let value = serde_json::to_value(&task).expect("serialize task");
        let created_at = value["created_at"].as_str().expect("timestamp string");
        assert!(created_at.contains('T'));
        assert_eq!(value["state"], json!("unknown"));
    }
}
