use agent_protocol::{ContextId, FormField, FormRender, FormResponse, Part, TextField};
use pretty_assertions::assert_eq;
use task_store::{Message, MessageForm, MessageStatus, Role, TaskState, TaskStore};

fn form(id: &str) -> FormRender {
    FormRender {
        id: id.to_string(),
        title: None,
        description: None,
        columns: None,
        submit_label: None,
        fields: vec![FormField::Text(TextField {
            id: "location".to_string(),
            label: "Location".to_string(),
            required: Some(true),
            col_span: None,
            placeholder: None,
            default_value: None,
        })],
    }
}

#[test]
fn task_awaiting_form_matches_pending_form_id_and_state() {
    let mut store = TaskStore::new();
    let waiting = store.create_task(ContextId::new("ctx"));
    let finished = store.create_task(ContextId::new("ctx"));

    store
        .set_pending_form(&waiting, Some(form("form-id")))
        .expect("pending form");
    store
        .set_state(&waiting, TaskState::InputRequired)
        .expect("state");
    store
        .set_pending_form(&finished, Some(form("form-id")))
        .expect("pending form");
    store
        .set_state(&finished, TaskState::Completed)
        .expect("state");

    let task = store.task_awaiting_form("form-id").expect("waiting task");
    assert_eq!(task.id, waiting);
    assert!(store.task_awaiting_form("other-form").is_none());
    assert!(store.has_pending_forms());
}

#[test]
fn snapshot_is_detached_from_later_mutation() {
    let mut store = TaskStore::new();
    let task_id = store.create_task(ContextId::new("ctx"));
    let message_id = TaskStore::new_message_id();
    store
        .append_message(&task_id, Message::agent_placeholder(message_id.clone()))
        .expect("append");

    let snapshot = store.snapshot();
    store
        .set_agent_parts(&task_id, &message_id, vec![Part::text("t", "Hello")])
        .expect("set parts");
    store
        .finalize_message(
            &task_id,
            &message_id,
            MessageStatus::Failed,
            Some("boom".to_string()),
        )
        .expect("finalize");

    let before = snapshot.task(&task_id).expect("task in snapshot");
    assert!(before.messages[0].parts.is_empty());

    let after = store.task(&task_id).expect("task in store");
    assert_eq!(after.messages[0].text(), "Hello");
    assert_eq!(after.messages[0].error.as_deref(), Some("boom"));
    assert_eq!(after.messages[0].status, Some(MessageStatus::Failed));
}

#[test]
fn user_message_keeps_answered_form() {
    let mut store = TaskStore::new();
    let task_id = store.create_task(ContextId::new("ctx"));
    let answered = MessageForm {
        request: form("form-id"),
        response: FormResponse::new("form-id"),
    };
    store
        .append_message(
            &task_id,
            Message::user(TaskStore::new_message_id(), Vec::new(), Some(answered.clone())),
        )
        .expect("append");

    let message = &store.task(&task_id).expect("task").messages[0];
    assert_eq!(message.role, Role::User);
    assert_eq!(message.form.as_ref(), Some(&answered));
    assert_eq!(message.status, None);
}

#[test]
fn clear_drops_every_task() {
    let mut store = TaskStore::new();
    let task_id = store.create_task(ContextId::new("ctx"));
    store.clear();

    assert!(store.is_empty());
    assert!(store.task(&task_id).is_none());
    assert!(!store.has_pending_forms());
}
