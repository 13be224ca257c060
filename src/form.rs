//! Form round-trip: routing a user's answer back to the task that asked for it.

use agent_protocol::{FieldValue, FormRender, FormResponse, TaskId};
use task_store::{MessageForm, TaskState, TaskStore};

use crate::error::RunError;

/// Validated answer bound to the task it continues.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FormContinuation {
    pub task_id: TaskId,
    pub form: MessageForm,
}

/// Finds the task a form response answers and checks the response against
/// that task's pending form.
///
/// An explicit `task_id` wins. Otherwise the response id selects the task
/// whose pending form carries the same id.
pub(crate) fn route_response(
    store: &TaskStore,
    task_id: Option<&TaskId>,
    response: FormResponse,
) -> Result<FormContinuation, RunError> {
    let task = match task_id {
        Some(task_id) => store.task(task_id).ok_or_else(|| RunError::TaskNotFound {
            task_id: task_id.clone(),
        })?,
        None => match store.task_awaiting_form(&response.id) {
            Some(task) => task,
            None => return Err(unmatched(store, &response)),
        },
    };

    let pending = match (&task.pending_form, task.state) {
        (Some(pending), TaskState::InputRequired) => pending,
        _ => {
            return Err(RunError::NoPendingForm {
                form_id: response.id,
            })
        }
    };
    if pending.id != response.id {
        return Err(RunError::FormMismatch {
            expected: pending.id.clone(),
            found: response.id,
        });
    }

    let response = response.sanitize_against(pending)?;
    Ok(FormContinuation {
        task_id: task.id.clone(),
        form: MessageForm {
            request: pending.clone(),
            response,
        },
    })
}

fn unmatched(store: &TaskStore, response: &FormResponse) -> RunError {
    let waiting = store.tasks().iter().rev().find_map(|task| {
        (task.state == TaskState::InputRequired)
            .then_some(task.pending_form.as_ref())
            .flatten()
    });

    match waiting {
        Some(pending) => RunError::FormMismatch {
            expected: pending.id.clone(),
            found: response.id.clone(),
        },
        None => RunError::NoPendingForm {
            form_id: response.id.clone(),
        },
    }
}

/// Starts a response to `form` prefilled with the form's declared defaults.
#[must_use]
pub fn response_with_defaults(form: &FormRender) -> FormResponse {
    let mut response = FormResponse::new(form.id.clone());
    response.values = form.default_values();
    response
}

/// Parses a `field=value` answer for `field_id` according to the field's type.
///
/// Multiselect and file values are comma separated; checkboxes accept
/// `true/false`, `yes/no`, or `1/0`. Returns `None` for unknown fields or
/// unparseable values.
#[must_use]
pub fn parse_field_value(form: &FormRender, field_id: &str, raw: &str) -> Option<FieldValue> {
    use agent_protocol::{FieldKind, FileValue};

    let field = form.field(field_id)?;
    let raw = raw.trim();
    let list = || {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    };

    match field.kind() {
        FieldKind::Text => Some(FieldValue::Text(raw.to_string())),
        FieldKind::Date => Some(FieldValue::Date(raw.to_string())),
        FieldKind::MultiSelect => Some(FieldValue::MultiSelect(list())),
        FieldKind::File => Some(FieldValue::File(
            list()
                .into_iter()
                .map(|uri| FileValue {
                    uri,
                    name: None,
                    mime_type: None,
                })
                .collect(),
        )),
        FieldKind::Checkbox => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(FieldValue::Checkbox(true)),
            "false" | "no" | "0" => Some(FieldValue::Checkbox(false)),
            _ => None,
        },
    }
}
