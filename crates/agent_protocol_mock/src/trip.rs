use agent_protocol::{FormField, FormRender, Part, TextField, Transform};

use crate::{RunScript, ScriptOutcome};

pub const TRIP_FORM_ID: &str = "form-id";

fn text_field(id: &str, label: &str, placeholder: &str) -> FormField {
    FormField::Text(TextField {
        id: id.to_string(),
        label: label.to_string(),
        required: Some(true),
        col_span: None,
        placeholder: Some(placeholder.to_string()),
        default_value: None,
    })
}

#[must_use]
pub fn trip_planner_form() -> FormRender {
    FormRender {
        id: TRIP_FORM_ID.to_string(),
        title: Some("Let's plan your trip".to_string()),
        description: Some("Tell me where and when you want to go.".to_string()),
        columns: Some(2),
        submit_label: Some("Plan it".to_string()),
        fields: vec![
            text_field("location", "Location", "e.g., Japan"),
            text_field("departure", "Departure", "e.g., 2026-04-01"),
        ],
    }
}

/// Two runs: the first asks for trip details, the second answers and completes.
#[must_use]
pub fn trip_planner_scripts() -> Vec<RunScript> {
    vec![
        RunScript::new(ScriptOutcome::FormRequired(trip_planner_form()))
            .with_server_task_id("trip-task")
            .stream_text("intro", "Happy to help! I need a few details first."),
        RunScript::new(ScriptOutcome::Complete)
            .stream_text(
                "plan",
                "Spring is cherry blossom season, so start in Tokyo and continue to Kyoto.",
            )
            .update(vec![Part::transform(
                "cite-1",
                31,
                Transform::Source {
                    sources: vec!["1".to_string()],
                },
            )])
            .update(vec![Part::transform(
                "closing",
                0,
                Transform::Append {
                    text: " Enjoy the trip!".to_string(),
                },
            )]),
    ]
}
