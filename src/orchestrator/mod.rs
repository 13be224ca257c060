//! Run orchestration: one exchange with the agent, from submission to a
//! terminal state, plus cancellation and conversation reset.
//!
//! All conversation state sits behind one mutex. It is only taken between
//! suspension points, so every reaction (a streamed update, a completion, a
//! cancel) lands as one atomic change to the store.

mod run;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_protocol::{
    ContextId, FilePart, FormRender, FormResponse, FulfillmentResolver, Fulfillments, MessageId,
    RunCanceller, TaskId, Transport,
};
use task_store::{MessageStatus, StoreError, StoreSnapshot, Task, TaskState, TaskStore};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accumulator::PartAccumulator;
use crate::config::OrchestratorConfig;
use crate::error::RunError;

/// What the user submits for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInput {
    pub text: Option<String>,
    pub attachments: Vec<FilePart>,
    pub form_response: Option<FormResponse>,
    /// Continues this task instead of starting a new one.
    pub task_id: Option<TaskId>,
}

impl RunInput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn form(response: FormResponse) -> Self {
        Self {
            form_response: Some(response),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: FilePart) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |text| text.trim().is_empty())
            && self.attachments.is_empty()
            && self.form_response.is_none()
    }
}

/// How a run attempt ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { task_id: TaskId },
    /// The agent paused the task until the user answers `form`.
    InputRequired { task_id: TaskId, form: FormRender },
    Aborted { task_id: TaskId },
}

impl RunOutcome {
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Completed { task_id }
            | Self::InputRequired { task_id, .. }
            | Self::Aborted { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Pending,
    Streaming,
    Completed,
    InputRequired,
    Aborted,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming)
    }
}

/// Timing of the latest run against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub updates: usize,
}

impl RunStats {
    #[must_use]
    pub fn duration(&self) -> Option<time::Duration> {
        self.finished_at
            .map(|finished_at| finished_at - self.started_at)
    }
}

#[derive(Debug, Clone, Copy)]
struct RunTrack {
    phase: RunPhase,
    stats: RunStats,
}

impl RunTrack {
    fn started() -> Self {
        Self {
            phase: RunPhase::Pending,
            stats: RunStats {
                started_at: OffsetDateTime::now_utc(),
                finished_at: None,
                updates: 0,
            },
        }
    }

    fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.stats.finished_at = Some(OffsetDateTime::now_utc());
    }
}

struct ActiveRun {
    run_id: u64,
    message_id: MessageId,
    abort: Option<oneshot::Sender<()>>,
    canceller: Option<Arc<dyn RunCanceller>>,
    accumulator: PartAccumulator,
}

struct State {
    store: TaskStore,
    context_id: ContextId,
    active_runs: HashMap<TaskId, ActiveRun>,
    tracks: HashMap<TaskId, RunTrack>,
    fulfillments: Option<Arc<dyn Fulfillments>>,
}

impl State {
    fn new() -> Self {
        Self {
            store: TaskStore::new(),
            context_id: new_context_id(),
            active_runs: HashMap::new(),
            tracks: HashMap::new(),
            fulfillments: None,
        }
    }

    fn task_for_run(&self, run_id: u64) -> Option<TaskId> {
        self.active_runs
            .iter()
            .find(|(_, run)| run.run_id == run_id)
            .map(|(task_id, _)| task_id.clone())
    }

    fn most_recent_run(&self) -> Option<TaskId> {
        self.active_runs
            .iter()
            .max_by_key(|(_, run)| run.run_id)
            .map(|(task_id, _)| task_id.clone())
    }

    fn finish_track(&mut self, task_id: &TaskId, phase: RunPhase) {
        if let Some(track) = self.tracks.get_mut(task_id) {
            track.finish(phase);
        }
    }

    /// Moves a task and everything keyed by it to the id the agent assigned.
    fn adopt_task_id(&mut self, task_id: &TaskId, server_id: TaskId) -> Result<(), StoreError> {
        self.store.rename_task(task_id, server_id.clone())?;
        if let Some(run) = self.active_runs.remove(task_id) {
            self.active_runs.insert(server_id.clone(), run);
        }
        if let Some(track) = self.tracks.remove(task_id) {
            self.tracks.insert(server_id, track);
        }
        Ok(())
    }

    /// Stops a run locally: the task is canceled and its agent message aborted.
    ///
    /// Returns the remote canceller when the transport had already started.
    fn abort_run(&mut self, task_id: &TaskId) -> Option<Arc<dyn RunCanceller>> {
        let mut run = self.active_runs.remove(task_id)?;

        if let Err(error) =
            self.store
                .finalize_message(task_id, &run.message_id, MessageStatus::Aborted, None)
        {
            warn!(%task_id, %error, "failed to mark agent message aborted");
        }
        if let Err(error) = self.store.set_state(task_id, TaskState::Canceled) {
            warn!(%task_id, %error, "failed to mark task canceled");
        }
        self.finish_track(task_id, RunPhase::Aborted);

        if let Some(abort) = run.abort.take() {
            let _ = abort.send(());
        }
        run.canceller
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn FulfillmentResolver>,
    config: OrchestratorConfig,
    next_run_id: AtomicU64,
    state: Mutex<State>,
}

/// Drives runs against one conversation context.
///
/// Cheap to clone; clones share the same conversation.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn FulfillmentResolver>) -> Self {
        Self::with_config(transport, resolver, OrchestratorConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn FulfillmentResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                resolver,
                config,
                next_run_id: AtomicU64::new(1),
                state: Mutex::new(State::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Cancels the most recently started run that is still in flight.
    pub async fn cancel(&self) -> Result<(), RunError> {
        let task_id = self
            .lock_state()
            .most_recent_run()
            .ok_or(RunError::NoRunInProgress)?;
        self.cancel_task(&task_id).await
    }

    /// Cancels the in-flight run of `task_id`.
    ///
    /// Local state settles before the remote side is asked to stop; a remote
    /// cancel that fails or never answers is only logged.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<(), RunError> {
        let canceller = {
            let mut state = self.lock_state();
            if !state.active_runs.contains_key(task_id) {
                return Err(RunError::NoRunInProgress);
            }
            state.abort_run(task_id)
        };
        info!(%task_id, "run canceled");

        if let Some(canceller) = canceller {
            issue_remote_cancel(task_id.clone(), canceller.as_ref());
        }
        Ok(())
    }

    /// Drops every task and starts a fresh conversation context.
    pub fn clear(&self) -> Result<(), RunError> {
        let mut state = self.lock_state();
        if let Some(task_id) = state.active_runs.keys().next() {
            return Err(RunError::run_in_progress(task_id));
        }

        state.store.clear();
        state.tracks.clear();
        state.fulfillments = None;
        state.context_id = new_context_id();
        info!(context_id = %state.context_id, "conversation cleared");
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock_state().store.snapshot()
    }

    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.lock_state().store.task(task_id).cloned()
    }

    #[must_use]
    pub fn phase(&self, task_id: &TaskId) -> RunPhase {
        self.lock_state()
            .tracks
            .get(task_id)
            .map_or(RunPhase::Idle, |track| track.phase)
    }

    #[must_use]
    pub fn stats(&self, task_id: &TaskId) -> Option<RunStats> {
        self.lock_state()
            .tracks
            .get(task_id)
            .map(|track| track.stats)
    }

    /// True while any run is in flight.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.lock_state().active_runs.is_empty()
    }

    #[must_use]
    pub fn is_task_pending(&self, task_id: &TaskId) -> bool {
        self.lock_state().active_runs.contains_key(task_id)
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.lock_state().context_id.clone()
    }

    fn is_active_run(&self, run_id: u64) -> bool {
        self.lock_state().task_for_run(run_id).is_some()
    }

    /// Treats a run whose future was dropped before settling as canceled.
    fn abandon_run(&self, run_id: u64) {
        let (task_id, canceller) = {
            let mut state = self.lock_state();
            let Some(task_id) = state.task_for_run(run_id) else {
                return;
            };
            let canceller = state.abort_run(&task_id);
            (task_id, canceller)
        };
        debug!(run_id, %task_id, "run dropped before settling");

        if let Some(canceller) = canceller {
            issue_remote_cancel(task_id, canceller.as_ref());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock_unpoisoned(&self.inner.state)
    }
}

/// Asks the agent to stop a run without waiting for its answer.
fn issue_remote_cancel(task_id: TaskId, canceller: &dyn RunCanceller) {
    let request = canceller.cancel();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                match request.await {
                    Ok(()) => debug!(%task_id, "remote cancel acknowledged"),
                    Err(error) => warn!(%task_id, %error, "remote cancel failed"),
                }
            });
        }
        Err(_) => warn!(%task_id, "no async runtime available; remote cancel dropped"),
    }
}

fn new_context_id() -> ContextId {
    ContextId::new(Uuid::new_v4().to_string())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
