//! Deterministic scripted implementation of the `agent_protocol` transport.
//!
//! Each call to [`Transport::start`] consumes the next [`RunScript`] in order.
//! Scripts stream their updates from a spawned task and then resolve the run
//! with a scripted outcome, so the crate needs a tokio runtime but no network.

mod trip;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_protocol::{
    run_channel, ContextId, FormRender, FormResponse, Part, RunCanceller, RunHandle, RunSink,
    RunUpdate, StartRequest, TaskId, Transport, TransportError, UnfinishedResult,
};
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::Notify;

pub use trip::{trip_planner_form, trip_planner_scripts, TRIP_FORM_ID};

/// One scripted action taken while a run streams.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Update(Vec<Part>),
    Pause(Duration),
    /// Blocks the run until the paired [`Gate`] is opened.
    Wait(Gate),
}

/// How a scripted run ends once its steps are exhausted.
#[derive(Debug, Clone)]
pub enum ScriptOutcome {
    Complete,
    FormRequired(FormRender),
    Fail(TransportError),
    /// Never resolves on its own; only a cancel ends the run.
    Hang,
}

/// How the transport answers a remote cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelBehavior {
    #[default]
    Acknowledge,
    Reject,
    /// The cancel future never resolves.
    NeverRespond,
}

/// Manually released checkpoint inside a script.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    notify: Arc<Notify>,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct RunScript {
    server_task_id: Option<TaskId>,
    steps: Vec<ScriptStep>,
    outcome: ScriptOutcome,
}

impl RunScript {
    #[must_use]
    pub fn new(outcome: ScriptOutcome) -> Self {
        Self {
            server_task_id: None,
            steps: Vec::new(),
            outcome,
        }
    }

    /// Task id the agent reports when the run does not continue an existing task.
    #[must_use]
    pub fn with_server_task_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.server_task_id = Some(task_id.into());
        self
    }

    #[must_use]
    pub fn update(mut self, parts: Vec<Part>) -> Self {
        self.steps.push(ScriptStep::Update(parts));
        self
    }

    #[must_use]
    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Pause(duration));
        self
    }

    #[must_use]
    pub fn wait(mut self, gate: &Gate) -> Self {
        self.steps.push(ScriptStep::Wait(gate.clone()));
        self
    }

    /// Streams `text` as one growing text part, one word per update.
    #[must_use]
    pub fn stream_text(mut self, part_id: &str, text: &str) -> Self {
        let mut delivered = String::new();
        for word in text.split_inclusive(' ') {
            delivered.push_str(word);
            self.steps
                .push(ScriptStep::Update(vec![Part::text(part_id, delivered.clone())]));
        }
        self
    }
}

/// Summary of one `start` call, kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRecord {
    pub context_id: ContextId,
    pub task_id: Option<TaskId>,
    pub text: String,
    pub form_response: Option<FormResponse>,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

struct ScriptedCanceller {
    state: Arc<CancelState>,
    behavior: CancelBehavior,
    cancel_count: Arc<AtomicUsize>,
}

impl RunCanceller for ScriptedCanceller {
    fn cancel(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            CancelBehavior::Acknowledge => {
                self.state.request();
                future::ready(Ok(())).boxed()
            }
            CancelBehavior::Reject => future::ready(Err(TransportError::Network(
                "cancel request was rejected".to_string(),
            )))
            .boxed(),
            CancelBehavior::NeverRespond => future::pending().boxed(),
        }
    }
}

/// Transport that replays queued [`RunScript`]s.
#[derive(Debug)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<RunScript>>,
    starts: Mutex<Vec<StartRecord>>,
    cancel_behavior: CancelBehavior,
    cancel_count: Arc<AtomicUsize>,
    next_task: AtomicU64,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(scripts: impl IntoIterator<Item = RunScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            starts: Mutex::new(Vec::new()),
            cancel_behavior: CancelBehavior::default(),
            cancel_count: Arc::new(AtomicUsize::new(0)),
            next_task: AtomicU64::new(1),
        }
    }

    /// Transport preloaded with the trip-planner conversation.
    #[must_use]
    pub fn trip_planner() -> Self {
        Self::new(trip_planner_scripts())
    }

    #[must_use]
    pub fn with_cancel_behavior(mut self, behavior: CancelBehavior) -> Self {
        self.cancel_behavior = behavior;
        self
    }

    pub fn push_script(&self, script: RunScript) {
        lock_unpoisoned(&self.scripts).push_back(script);
    }

    #[must_use]
    pub fn remaining_scripts(&self) -> usize {
        lock_unpoisoned(&self.scripts).len()
    }

    #[must_use]
    pub fn starts(&self) -> Vec<StartRecord> {
        lock_unpoisoned(&self.starts).clone()
    }

    /// Number of remote cancel requests issued against runs of this transport.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    fn server_task_id(&self, request: &StartRequest, script: &RunScript) -> TaskId {
        if let Some(task_id) = &request.task_id {
            return task_id.clone();
        }
        script.server_task_id.clone().unwrap_or_else(|| {
            let ordinal = self.next_task.fetch_add(1, Ordering::SeqCst);
            TaskId::new(format!("server-task-{ordinal}"))
        })
    }
}

impl Transport for ScriptedTransport {
    fn start(&self, request: StartRequest) -> Result<RunHandle, TransportError> {
        let script = lock_unpoisoned(&self.scripts)
            .pop_front()
            .ok_or_else(|| TransportError::Network("no scripted run left".to_string()))?;

        let task_id = self.server_task_id(&request, &script);
        lock_unpoisoned(&self.starts).push(StartRecord {
            context_id: request.context_id.clone(),
            task_id: request.task_id.clone(),
            text: request
                .message
                .parts
                .iter()
                .filter_map(Part::as_text)
                .collect(),
            form_response: request.form_response.clone(),
        });

        let cancel = Arc::new(CancelState::default());
        let canceller = Arc::new(ScriptedCanceller {
            state: Arc::clone(&cancel),
            behavior: self.cancel_behavior,
            cancel_count: Arc::clone(&self.cancel_count),
        });
        let (sink, handle) = run_channel(request.task_id, canceller);

        tokio::spawn(play_script(script, task_id, sink, cancel));
        Ok(handle)
    }
}

async fn play_script(script: RunScript, task_id: TaskId, sink: RunSink, cancel: Arc<CancelState>) {
    for step in script.steps {
        if cancel.is_requested() {
            sink.finish(Err(TransportError::Cancelled));
            return;
        }

        match step {
            ScriptStep::Update(parts) => {
                sink.emit(RunUpdate {
                    task_id: task_id.clone(),
                    parts,
                });
                tokio::task::yield_now().await;
            }
            ScriptStep::Pause(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => {}
                    () = cancel.notify.notified() => {}
                }
            }
            ScriptStep::Wait(gate) => {
                tokio::select! {
                    () = gate.wait() => {}
                    () = cancel.notify.notified() => {}
                }
            }
        }
    }

    if cancel.is_requested() {
        sink.finish(Err(TransportError::Cancelled));
        return;
    }

    let result = match script.outcome {
        ScriptOutcome::Complete => Ok(None),
        ScriptOutcome::FormRequired(form) => Ok(Some(UnfinishedResult::FormRequired { task_id, form })),
        ScriptOutcome::Fail(error) => Err(error),
        ScriptOutcome::Hang => {
            cancel.notify.notified().await;
            Err(TransportError::Cancelled)
        }
    };
    sink.finish(result);
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use agent_protocol::{
        MessageId, OutgoingMessage, PlatformFulfillments, RunResult,
    };
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(text: &str, task_id: Option<&str>) -> StartRequest {
        StartRequest {
            message: OutgoingMessage {
                id: MessageId::new("m-1"),
                parts: vec![Part::text("p-1", text)],
            },
            context_id: ContextId::new("ctx"),
            fulfillments: Arc::new(PlatformFulfillments::new("token")),
            task_id: task_id.map(TaskId::new),
            form_response: None,
        }
    }

    async fn drain(mut handle: RunHandle) -> (Vec<RunUpdate>, RunResult) {
        let mut subscription = handle.subscribe().expect("subscribe");
        let completion = handle.completion().expect("completion");
        let mut updates = Vec::new();
        while let Some(update) = subscription.next().await {
            updates.push(update);
        }
        (updates, completion.await)
    }

    #[tokio::test]
    async fn replays_updates_then_completes() {
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Complete)
            .with_server_task_id("remote-1")
            .stream_text("t-1", "Hello there")]);

        let handle = transport.start(request("hi", None)).expect("start");
        let (updates, result) = drain(handle).await;

        assert_eq!(result, Ok(None));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].task_id, TaskId::new("remote-1"));
        assert_eq!(updates[1].parts, vec![Part::text("t-1", "Hello there")]);
        assert_eq!(transport.starts()[0].text, "hi");
    }

    #[tokio::test]
    async fn continuation_keeps_requested_task_id() {
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Complete)
            .with_server_task_id("ignored")
            .update(vec![Part::text("t", "ok")])]);

        let handle = transport
            .start(request("again", Some("task-7")))
            .expect("start");
        assert_eq!(handle.task_id(), Some(&TaskId::new("task-7")));
        let (updates, _) = drain(handle).await;
        assert_eq!(updates[0].task_id, TaskId::new("task-7"));
    }

    #[tokio::test]
    async fn form_required_outcome_carries_the_form() {
        let transport = ScriptedTransport::trip_planner();
        let handle = transport.start(request("Plan a trip to Japan", None)).expect("start");
        let (_, result) = drain(handle).await;

        assert_matches!(
            result,
            Ok(Some(UnfinishedResult::FormRequired { form, .. })) if form.id == TRIP_FORM_ID
        );
        assert_eq!(transport.remaining_scripts(), 1);
    }

    #[tokio::test]
    async fn exhausted_script_queue_fails_start() {
        let transport = ScriptedTransport::new([]);
        assert_matches!(
            transport.start(request("hi", None)),
            Err(TransportError::Network(_))
        );
    }

    #[tokio::test]
    async fn acknowledged_cancel_ends_a_hanging_run() {
        let gate = Gate::new();
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Hang)
            .update(vec![Part::text("t", "partial")])
            .wait(&gate)]);

        let handle = transport.start(request("hi", None)).expect("start");
        handle.cancel().await.expect("cancel acknowledged");
        let (_, result) = drain(handle).await;

        assert_eq!(result, Err(TransportError::Cancelled));
        assert_eq!(transport.cancel_count(), 1);
    }

    #[tokio::test]
    async fn rejected_cancel_reports_an_error() {
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Complete)])
            .with_cancel_behavior(CancelBehavior::Reject);
        let handle = transport.start(request("hi", None)).expect("start");

        assert_matches!(handle.cancel().await, Err(TransportError::Network(_)));
    }

    #[tokio::test]
    async fn never_responding_cancel_stays_pending() {
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Hang)])
            .with_cancel_behavior(CancelBehavior::NeverRespond);
        let handle = transport.start(request("hi", None)).expect("start");

        assert!(handle.cancel().now_or_never().is_none());
        assert_eq!(transport.cancel_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_is_reported_as_completion_error() {
        let transport = ScriptedTransport::new([RunScript::new(ScriptOutcome::Fail(
            TransportError::Remote("agent crashed".to_string()),
        ))]);
        let handle = transport.start(request("hi", None)).expect("start");
        let (updates, result) = drain(handle).await;

        assert!(updates.is_empty());
        assert_eq!(result, Err(TransportError::Remote("agent crashed".to_string())));
    }
}
