use std::time::Duration;

use agent_chat::form::{parse_field_value, response_with_defaults};
use agent_chat::{RunError, RunInput, RunOrchestrator, RunOutcome};
use agent_protocol::{FormRender, MessageId, Part, TaskId};
use task_store::{StoreSnapshot, TaskState};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::commands::{parse_slash_command, FieldAssignment, SlashCommand};

pub const HELP_TEXT: &str =
    "Commands: /help, /form field=value ..., /cancel, /clear, /quit";

const STREAM_TICK: Duration = Duration::from_millis(20);

/// Text written to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Streamed agent text, printed without a trailing newline.
    Chunk(String),
    Line(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

/// Line-oriented front-end over one [`RunOrchestrator`] conversation.
pub struct ChatApp {
    orchestrator: RunOrchestrator,
    output: UnboundedSender<Output>,
    current_run: Option<JoinHandle<()>>,
}

impl ChatApp {
    pub fn new(orchestrator: RunOrchestrator, output: UnboundedSender<Output>) -> Self {
        Self {
            orchestrator,
            output,
            current_run: None,
        }
    }

    pub async fn on_line(&mut self, line: &str) -> Control {
        let prompt = line.trim();
        if prompt.is_empty() {
            return Control::Continue;
        }

        let Some(command) = parse_slash_command(prompt) else {
            let mut input = RunInput::text(prompt);
            if let Some(task_id) = self.resumable_task() {
                input = input.for_task(task_id);
            }
            self.start_run(input);
            return Control::Continue;
        };

        match command {
            SlashCommand::Help => self.line(HELP_TEXT),
            SlashCommand::Clear => match self.orchestrator.clear() {
                Ok(()) => self.line("Conversation cleared"),
                Err(error) => self.line(format!("Cannot clear: {error}")),
            },
            SlashCommand::Cancel => match self.orchestrator.cancel().await {
                Ok(()) => self.line("Run cancelled"),
                Err(RunError::NoRunInProgress) => self.line("No active run"),
                Err(error) => self.line(format!("Cancel failed: {error}")),
            },
            SlashCommand::Quit => return Control::Quit,
            SlashCommand::Form(assignments) => self.answer_form(&assignments),
            SlashCommand::Malformed { command, reason } => {
                self.line(format!("{command}: {reason}"));
            }
            SlashCommand::Unknown(command) => self.line(format!("Unknown command: {command}")),
        }
        Control::Continue
    }

    /// Waits for the run started last, if any, to settle.
    pub async fn wait_idle(&mut self) {
        if let Some(run) = self.current_run.take() {
            if let Err(error) = run.await {
                debug!(%error, "run task ended abnormally");
            }
        }
    }

    fn answer_form(&mut self, assignments: &[FieldAssignment]) {
        let Some((task_id, form)) = pending_form(&self.orchestrator.snapshot()) else {
            self.line("No form is waiting for an answer");
            return;
        };

        let mut response = response_with_defaults(&form);
        for assignment in assignments {
            match parse_field_value(&form, &assignment.field_id, &assignment.raw) {
                Some(value) => {
                    response.values.insert(assignment.field_id.clone(), value);
                }
                None => {
                    self.line(format!(
                        "Invalid value for field '{}': {}",
                        assignment.field_id, assignment.raw
                    ));
                    return;
                }
            }
        }

        self.start_run(RunInput::form(response).for_task(task_id));
    }

    /// Most recent task a plain message should continue.
    fn resumable_task(&self) -> Option<TaskId> {
        let snapshot = self.orchestrator.snapshot();
        let task = snapshot.tasks.last()?;
        (task.state != TaskState::Failed).then(|| task.id.clone())
    }

    fn start_run(&mut self, input: RunInput) {
        let orchestrator = self.orchestrator.clone();
        let output = self.output.clone();
        self.current_run = Some(tokio::spawn(drive_run(orchestrator, input, output)));
    }

    fn line(&self, text: impl Into<String>) {
        let _ = self.output.send(Output::Line(text.into()));
    }
}

/// Runs one exchange, echoing agent text as it streams in.
async fn drive_run(orchestrator: RunOrchestrator, input: RunInput, output: UnboundedSender<Output>) {
    let run = orchestrator.run(input);
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(STREAM_TICK);
    let mut echo = StreamEcho::default();

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = ticker.tick() => echo.flush(&orchestrator.snapshot(), &output),
        }
    };
    echo.flush(&orchestrator.snapshot(), &output);
    echo.finish(&output);

    let send = |text: String| {
        let _ = output.send(Output::Line(text));
    };
    match result {
        Ok(RunOutcome::Completed { .. } | RunOutcome::Aborted { .. }) => {}
        Ok(RunOutcome::InputRequired { form, .. }) => {
            for line in render_form(&form) {
                send(line);
            }
        }
        Err(RunError::RunInProgress { .. }) => {
            send("Run already in progress. Use /cancel to stop it.".to_string());
        }
        Err(error) => send(format!("Run failed: {error}")),
    }
}

/// Tracks how much of the streaming agent message has been printed.
#[derive(Debug, Default)]
struct StreamEcho {
    message_id: Option<MessageId>,
    printed: String,
    revised: Option<String>,
    line_open: bool,
    /// Auth part ids already shown for this message.
    announced: Vec<String>,
}

impl StreamEcho {
    fn flush(&mut self, snapshot: &StoreSnapshot, output: &UnboundedSender<Output>) {
        let Some(message) = snapshot
            .tasks
            .last()
            .and_then(|task| task.last_agent_message())
        else {
            return;
        };
        if self.message_id.as_ref() != Some(&message.id) {
            self.finish(output);
            self.message_id = Some(message.id.clone());
        }

        let text = message.text();
        match text.strip_prefix(self.printed.as_str()) {
            Some(delta) if !delta.is_empty() => {
                let _ = output.send(Output::Chunk(delta.to_string()));
                self.printed = text;
                self.revised = None;
                self.line_open = true;
            }
            Some(_) => {}
            // A transform edited text that was already printed.
            None => self.revised = Some(text),
        }

        for part in &message.parts {
            let Part::Auth(auth) = part else {
                continue;
            };
            if self.announced.contains(&auth.id) {
                continue;
            }
            self.announced.push(auth.id.clone());
            self.end_line(output);
            let _ = output.send(Output::Line(format!("Authorization required: {}", auth.url)));
        }
    }

    fn end_line(&mut self, output: &UnboundedSender<Output>) {
        if std::mem::take(&mut self.line_open) {
            let _ = output.send(Output::Line(String::new()));
        }
    }

    fn finish(&mut self, output: &UnboundedSender<Output>) {
        self.end_line(output);
        if let Some(revised) = self.revised.take() {
            let _ = output.send(Output::Line(revised));
        }
        self.printed.clear();
        self.announced.clear();
        self.message_id = None;
    }
}

/// Latest task waiting on a form, with that form.
fn pending_form(snapshot: &StoreSnapshot) -> Option<(TaskId, FormRender)> {
    snapshot.tasks.iter().rev().find_map(|task| {
        let form = task.pending_form.as_ref()?;
        (task.state == TaskState::InputRequired).then(|| (task.id.clone(), form.clone()))
    })
}

pub fn render_form(form: &FormRender) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!(
        "Form: {}",
        form.title.as_deref().unwrap_or(form.id.as_str())
    ));
    if let Some(description) = &form.description {
        lines.push(description.clone());
    }
    for field in &form.fields {
        let required = if field.is_required() { ", required" } else { "" };
        lines.push(format!(
            "  {} ({}{required}): {}",
            field.id(),
            field.kind(),
            field.label()
        ));
    }
    let example = form
        .fields
        .iter()
        .map(|field| format!("{}=...", field.id()))
        .collect::<Vec<_>>()
        .join(" ");
    lines.push(format!("Answer with /form {example}"));
    lines
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agent_protocol::{AuthPart, PlatformFulfillments, StaticResolver, Transport};
    use agent_protocol_mock::{trip_planner_form, RunScript, ScriptOutcome, ScriptedTransport};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    fn app(transport: ScriptedTransport) -> (ChatApp, UnboundedReceiver<Output>) {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let orchestrator = RunOrchestrator::new(
            transport,
            Arc::new(StaticResolver::new(PlatformFulfillments::new("cli-test"))),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (ChatApp::new(orchestrator, tx), rx)
    }

    fn lines(rx: &mut UnboundedReceiver<Output>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(output) = rx.try_recv() {
            if let Output::Line(line) = output {
                lines.push(line);
            }
        }
        lines
    }

    fn transcript(rx: &mut UnboundedReceiver<Output>) -> String {
        let mut text = String::new();
        while let Ok(output) = rx.try_recv() {
            match output {
                Output::Chunk(chunk) => text.push_str(&chunk),
                Output::Line(line) => {
                    text.push_str(&line);
                    text.push('\n');
                }
            }
        }
        text
    }

    #[tokio::test]
    async fn help_and_unknown_commands_answer_locally() {
        let (mut app, mut rx) = app(ScriptedTransport::new([]));

        assert_eq!(app.on_line("/help").await, Control::Continue);
        assert_eq!(app.on_line("/bogus").await, Control::Continue);
        assert_eq!(app.on_line("/cancel").await, Control::Continue);
        assert_eq!(app.on_line("/quit").await, Control::Quit);

        assert_eq!(
            lines(&mut rx),
            vec![
                HELP_TEXT.to_string(),
                "Unknown command: /bogus".to_string(),
                "No active run".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn form_without_a_pending_form_is_refused() {
        let (mut app, mut rx) = app(ScriptedTransport::trip_planner());
        app.on_line("/form location=Japan").await;
        assert_eq!(
            lines(&mut rx),
            vec!["No form is waiting for an answer".to_string()]
        );
    }

    #[tokio::test]
    async fn trip_planner_conversation_runs_end_to_end() {
        let (mut app, mut rx) = app(ScriptedTransport::trip_planner());

        app.on_line("Plan a trip to Japan").await;
        app.wait_idle().await;
        let first = transcript(&mut rx);
        assert!(first.contains("Happy to help!"), "{first}");
        assert!(first.contains("Answer with /form location=... departure=..."), "{first}");

        app.on_line("/form location=Japan departure=2026-04-01").await;
        app.wait_idle().await;
        let second = transcript(&mut rx);
        assert!(second.contains("Enjoy the trip!"), "{second}");
        assert!(!second.contains("Run failed"), "{second}");
    }

    #[tokio::test]
    async fn invalid_field_value_is_reported_before_sending() {
        let (mut app, mut rx) = app(ScriptedTransport::trip_planner());
        app.on_line("Plan a trip to Japan").await;
        app.wait_idle().await;
        let _ = transcript(&mut rx);

        app.on_line("/form budget=lots").await;
        assert_eq!(
            lines(&mut rx),
            vec!["Invalid value for field 'budget': lots".to_string()]
        );
    }

    #[tokio::test]
    async fn auth_request_is_printed_once_with_its_url() {
        let auth = Part::Auth(AuthPart {
            id: "login".to_string(),
            url: "https://auth.local/login".to_string(),
            task_id: None,
        });
        let script = RunScript::new(ScriptOutcome::Complete)
            .update(vec![Part::text("t", "Sign in first.")])
            .update(vec![Part::text("t", "Sign in first."), auth.clone()])
            .update(vec![auth]);
        let (mut app, mut rx) = app(ScriptedTransport::new([script]));

        app.on_line("check my calendar").await;
        app.wait_idle().await;

        let transcript = transcript(&mut rx);
        assert_eq!(
            transcript,
            "Sign in first.\nAuthorization required: https://auth.local/login\n"
        );
    }

    #[test]
    fn form_prompt_lists_every_field() {
        assert_eq!(
            render_form(&trip_planner_form()),
            vec![
                "Form: Let's plan your trip".to_string(),
                "Tell me where and when you want to go.".to_string(),
                "  location (text, required): Location".to_string(),
                "  departure (text, required): Departure".to_string(),
                "Answer with /form location=... departure=...".to_string(),
            ]
        );
    }
}
