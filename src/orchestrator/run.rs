use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_protocol::{
    AuthPart, ContextId, FormResponse, FulfillmentError, Fulfillments, OutgoingMessage, Part,
    RunHandle, RunUpdate, StartRequest, TaskId, TransportError, UnfinishedResult,
};
use task_store::{Message, MessageStatus, StoreError, TaskState, TaskStore};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    issue_remote_cancel, ActiveRun, RunInput, RunOrchestrator, RunOutcome, RunPhase, RunTrack,
    State,
};
use crate::accumulator::PartAccumulator;
use crate::error::RunError;
use crate::form;

type Settlement = Result<Option<UnfinishedResult>, RunError>;

/// Everything a run needs once its guard is reserved.
struct Prepared {
    run_id: u64,
    task_id: TaskId,
    continuing: Option<TaskId>,
    message: OutgoingMessage,
    form_response: Option<FormResponse>,
    context_id: ContextId,
    abort: oneshot::Receiver<()>,
}

/// Abandons the run if its future is dropped before it settles.
struct RunGuard<'a> {
    orchestrator: &'a RunOrchestrator,
    run_id: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.abandon_run(self.run_id);
    }
}

impl RunOrchestrator {
    /// Runs one exchange with the agent.
    ///
    /// Fails fast with [`RunError::RunInProgress`] when the addressed task
    /// already has a run in flight. Transport and fulfillment failures are
    /// recorded on the agent message before they are returned.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self, input: RunInput) -> Result<RunOutcome, RunError> {
        if input.is_empty() {
            return Err(RunError::EmptyInput);
        }

        let Prepared {
            run_id,
            mut task_id,
            continuing,
            message,
            form_response,
            context_id,
            mut abort,
        } = self.prepare(input)?;
        let _guard = RunGuard {
            orchestrator: self,
            run_id,
        };
        info!(run_id, %task_id, continuing = continuing.is_some(), "run started");

        let fulfillments = match self.fulfillments().await {
            Ok(fulfillments) => fulfillments,
            Err(error) => return self.settle(run_id, &task_id, Err(error.into())),
        };
        if !self.is_active_run(run_id) {
            return Ok(RunOutcome::Aborted { task_id });
        }

        let request = StartRequest {
            message,
            context_id,
            fulfillments,
            task_id: continuing,
            form_response,
        };
        let mut handle = match self.inner.transport.start(request) {
            Ok(handle) => handle,
            Err(error) => return self.settle(run_id, &task_id, Err(error.into())),
        };

        match self.mark_streaming(run_id, &handle) {
            Some(current) => task_id = current,
            None => {
                issue_remote_cancel(task_id.clone(), handle.canceller().as_ref());
                return Ok(RunOutcome::Aborted { task_id });
            }
        }

        let (Some(mut updates), Some(mut completion)) = (handle.subscribe(), handle.completion())
        else {
            issue_remote_cancel(task_id.clone(), handle.canceller().as_ref());
            let error = TransportError::Protocol("run handle was already consumed".to_string());
            return self.settle(run_id, &task_id, Err(error.into()));
        };

        let run_timeout = self.inner.config.run_timeout;
        let limit = run_timeout.unwrap_or_default();
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let settled = loop {
            tokio::select! {
                biased;
                _ = &mut abort => break None,
                Some(update) = updates.next() => {
                    if let Some(current) = self.apply_update(run_id, &mut handle, update) {
                        task_id = current;
                    }
                }
                result = &mut completion => break Some(result.map_err(RunError::from)),
                () = &mut deadline, if run_timeout.is_some() => {
                    warn!(run_id, %task_id, timeout_ms = limit.as_millis(), "run timed out");
                    issue_remote_cancel(task_id.clone(), handle.canceller().as_ref());
                    break Some(Err(TransportError::Timeout(limit).into()));
                }
            }
        };
        updates.unsubscribe();

        if let Some(Ok(Some(UnfinishedResult::FormRequired {
            task_id: server_id, ..
        }))) = &settled
        {
            if handle.task_id().is_none() {
                if let Some(current) = self.adopt_for_run(run_id, &mut handle, server_id.clone()) {
                    task_id = current;
                }
            }
        }

        match settled {
            Some(result) => self.settle(run_id, &task_id, result),
            None => {
                debug!(run_id, %task_id, "run aborted locally");
                Ok(RunOutcome::Aborted { task_id })
            }
        }
    }

    /// Reserves the task guard and records the submission, without suspending.
    fn prepare(&self, input: RunInput) -> Result<Prepared, RunError> {
        let RunInput {
            text,
            attachments,
            form_response,
            task_id,
        } = input;

        let mut guard = self.lock_state();
        let state = &mut *guard;

        if let Some(task_id) = &task_id {
            if state.active_runs.contains_key(task_id) {
                return Err(RunError::run_in_progress(task_id));
            }
        }

        let (continuing, answered) = match form_response {
            Some(response) => {
                let continuation = form::route_response(&state.store, task_id.as_ref(), response)?;
                (Some(continuation.task_id), Some(continuation.form))
            }
            None => match task_id {
                Some(task_id) if state.store.task(&task_id).is_none() => {
                    return Err(RunError::TaskNotFound { task_id });
                }
                task_id => (task_id, None),
            },
        };
        if let Some(task_id) = &continuing {
            if state.active_runs.contains_key(task_id) {
                return Err(RunError::run_in_progress(task_id));
            }
        }

        let task_id = match &continuing {
            Some(task_id) => task_id.clone(),
            None => state.store.create_task(state.context_id.clone()),
        };

        let mut parts = Vec::new();
        if let Some(text) = text.filter(|text| !text.trim().is_empty()) {
            parts.push(Part::text(Uuid::new_v4().to_string(), text));
        }
        parts.extend(attachments.into_iter().map(Part::File));

        let form_response = answered.as_ref().map(|answered| answered.response.clone());
        let user_message_id = TaskStore::new_message_id();
        let agent_message_id = TaskStore::new_message_id();
        state.store.append_message(
            &task_id,
            Message::user(user_message_id.clone(), parts.clone(), answered),
        )?;
        state
            .store
            .append_message(&task_id, Message::agent_placeholder(agent_message_id.clone()))?;
        state.store.set_state(&task_id, TaskState::Submitted)?;

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (abort_tx, abort_rx) = oneshot::channel();
        state.active_runs.insert(
            task_id.clone(),
            ActiveRun {
                run_id,
                message_id: agent_message_id,
                abort: Some(abort_tx),
                canceller: None,
                accumulator: PartAccumulator::new(),
            },
        );
        state.tracks.insert(task_id.clone(), RunTrack::started());

        Ok(Prepared {
            run_id,
            task_id,
            continuing,
            message: OutgoingMessage {
                id: user_message_id,
                parts,
            },
            form_response,
            context_id: state.context_id.clone(),
            abort: abort_rx,
        })
    }

    async fn fulfillments(&self) -> Result<Arc<dyn Fulfillments>, FulfillmentError> {
        let cache = self.inner.config.cache_fulfillments;
        if cache {
            let cached = self.lock_state().fulfillments.clone();
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }

        let resolved = self.inner.resolver.resolve().await?;
        if cache {
            self.lock_state()
                .fulfillments
                .get_or_insert_with(|| Arc::clone(&resolved));
        }
        Ok(resolved)
    }

    /// Moves a started run to streaming. Returns `None` if it was canceled meanwhile.
    fn mark_streaming(&self, run_id: u64, handle: &RunHandle) -> Option<TaskId> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let task_id = state.task_for_run(run_id)?;

        if let Some(run) = state.active_runs.get_mut(&task_id) {
            run.canceller = Some(handle.canceller());
        }
        if let Err(error) = state.store.set_state(&task_id, TaskState::Working) {
            warn!(%task_id, %error, "failed to mark task working");
        }
        if let Err(error) = state.store.set_pending_form(&task_id, None) {
            warn!(%task_id, %error, "failed to clear pending form");
        }
        if let Some(track) = state.tracks.get_mut(&task_id) {
            track.phase = RunPhase::Streaming;
        }
        Some(task_id)
    }

    /// Applies one streamed update. Returns the run's current task id, or
    /// `None` when the run is no longer active and the update was ignored.
    fn apply_update(&self, run_id: u64, handle: &mut RunHandle, update: RunUpdate) -> Option<TaskId> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(mut task_id) = state.task_for_run(run_id) else {
            debug!(run_id, "ignoring update for inactive run");
            return None;
        };

        if handle.task_id().is_none() {
            task_id = adopt_server_id(state, handle, task_id, update.task_id);
        }

        let run = state.active_runs.get_mut(&task_id)?;
        run.accumulator
            .extend(update.parts.into_iter().map(|part| bind_auth(part, &task_id)));
        let parts = run.accumulator.parts();
        let message_id = run.message_id.clone();

        if let Some(track) = state.tracks.get_mut(&task_id) {
            track.stats.updates += 1;
        }
        if let Err(error) = state.store.set_agent_parts(&task_id, &message_id, parts) {
            warn!(%task_id, %error, "failed to store streamed parts");
        }
        Some(task_id)
    }

    /// Adopts the agent's task id for a run that never streamed an update.
    fn adopt_for_run(&self, run_id: u64, handle: &mut RunHandle, server_id: TaskId) -> Option<TaskId> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let task_id = state.task_for_run(run_id)?;
        Some(adopt_server_id(state, handle, task_id, server_id))
    }

    /// Applies the terminal result of a run and releases its guard.
    ///
    /// Store failures past this point are logged; the guard is already gone
    /// and the remaining updates still apply.
    fn settle(&self, run_id: u64, task_id: &TaskId, result: Settlement) -> Result<RunOutcome, RunError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(task_id) = state.task_for_run(run_id) else {
            debug!(run_id, %task_id, "run settled after cancel; result dropped");
            return Ok(RunOutcome::Aborted {
                task_id: task_id.clone(),
            });
        };
        let Some(run) = state.active_runs.remove(&task_id) else {
            return Ok(RunOutcome::Aborted { task_id });
        };
        let message_id = run.message_id;

        match validate_unfinished(result) {
            Ok(None) => {
                record(
                    state
                        .store
                        .finalize_message(&task_id, &message_id, MessageStatus::Completed, None),
                    &task_id,
                    "finalize message",
                );
                record(
                    state.store.set_state(&task_id, TaskState::Completed),
                    &task_id,
                    "set state",
                );
                state.finish_track(&task_id, RunPhase::Completed);
                info!(run_id, %task_id, "run completed");
                Ok(RunOutcome::Completed { task_id })
            }
            Ok(Some(UnfinishedResult::FormRequired { form, .. })) => {
                record(
                    state
                        .store
                        .push_agent_part(&task_id, &message_id, Part::Form(form.clone())),
                    &task_id,
                    "attach form",
                );
                record(
                    state.store.finalize_message(
                        &task_id,
                        &message_id,
                        MessageStatus::InputRequired,
                        None,
                    ),
                    &task_id,
                    "finalize message",
                );
                record(
                    state.store.set_state(&task_id, TaskState::InputRequired),
                    &task_id,
                    "set state",
                );
                record(
                    state.store.set_pending_form(&task_id, Some(form.clone())),
                    &task_id,
                    "set pending form",
                );
                state.finish_track(&task_id, RunPhase::InputRequired);
                info!(run_id, %task_id, form_id = %form.id, "run paused for form input");
                Ok(RunOutcome::InputRequired { task_id, form })
            }
            Err(RunError::Transport(TransportError::Cancelled)) => {
                record(
                    state
                        .store
                        .finalize_message(&task_id, &message_id, MessageStatus::Aborted, None),
                    &task_id,
                    "finalize message",
                );
                record(
                    state.store.set_state(&task_id, TaskState::Canceled),
                    &task_id,
                    "set state",
                );
                state.finish_track(&task_id, RunPhase::Aborted);
                info!(run_id, %task_id, "run canceled by agent");
                Ok(RunOutcome::Aborted { task_id })
            }
            Err(error) => {
                record(
                    state.store.finalize_message(
                        &task_id,
                        &message_id,
                        MessageStatus::Failed,
                        Some(error.to_string()),
                    ),
                    &task_id,
                    "finalize message",
                );
                let fatal = matches!(
                    &error,
                    RunError::Transport(transport) if transport.is_protocol_fatal()
                );
                let awaiting_form = state
                    .store
                    .task(&task_id)
                    .is_some_and(|task| task.pending_form.is_some());
                if fatal {
                    record(
                        state.store.set_state(&task_id, TaskState::Failed),
                        &task_id,
                        "set state",
                    );
                } else if awaiting_form {
                    // The continuation never started; the form can be answered again.
                    record(
                        state.store.set_state(&task_id, TaskState::InputRequired),
                        &task_id,
                        "set state",
                    );
                }
                state.finish_track(&task_id, RunPhase::Failed);
                warn!(run_id, %task_id, %error, "run failed");
                Err(error)
            }
        }
    }
}

fn record(result: Result<(), StoreError>, task_id: &TaskId, action: &str) {
    if let Err(error) = result {
        warn!(%task_id, %error, action, "store update failed while settling run");
    }
}

/// Back-fills the handle with the agent's task id and renames the local task to match.
fn adopt_server_id(
    state: &mut State,
    handle: &mut RunHandle,
    task_id: TaskId,
    server_id: TaskId,
) -> TaskId {
    handle.set_task_id(server_id.clone());
    if server_id == task_id {
        return task_id;
    }
    match state.adopt_task_id(&task_id, server_id.clone()) {
        Ok(()) => {
            debug!(local = %task_id, server = %server_id, "adopted agent task id");
            server_id
        }
        Err(error) => {
            warn!(%task_id, %server_id, %error, "could not adopt agent task id");
            task_id
        }
    }
}

/// Auth parts without a task are bound to the task they streamed on.
fn bind_auth(part: Part, task_id: &TaskId) -> Part {
    match part {
        Part::Auth(AuthPart {
            id,
            url,
            task_id: None,
        }) => Part::Auth(AuthPart {
            id,
            url,
            task_id: Some(task_id.clone()),
        }),
        part => part,
    }
}

/// Rejects a form request the client could not render.
fn validate_unfinished(result: Settlement) -> Settlement {
    if let Ok(Some(UnfinishedResult::FormRequired { form, .. })) = &result {
        if let Err(error) = form.validate() {
            return Err(
                TransportError::Protocol(format!("agent sent an invalid form: {error}")).into(),
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use agent_protocol::{PlatformFulfillments, StaticResolver};
    use agent_protocol_mock::ScriptedTransport;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn orchestrator() -> RunOrchestrator {
        RunOrchestrator::new(
            Arc::new(ScriptedTransport::new([])),
            Arc::new(StaticResolver::new(PlatformFulfillments::new("t"))),
        )
    }

    #[test]
    fn settle_finishes_the_task_when_the_message_was_already_finalized() {
        let orchestrator = orchestrator();
        let prepared = orchestrator
            .prepare(RunInput::text("hello"))
            .expect("run prepared");
        let task_id = prepared.task_id.clone();
        {
            let mut state = orchestrator.lock_state();
            let message_id = state.active_runs[&task_id].message_id.clone();
            state
                .store
                .finalize_message(&task_id, &message_id, MessageStatus::Failed, None)
                .expect("finalize ahead of settle");
        }

        let outcome = orchestrator
            .settle(prepared.run_id, &task_id, Ok(None))
            .expect("settle logs the store failure and continues");

        assert_matches!(outcome, RunOutcome::Completed { task_id: done } if done == task_id);
        assert!(!orchestrator.is_pending());
        let task = orchestrator.task(&task_id).expect("task exists");
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(
            task.last_agent_message().and_then(|message| message.status),
            Some(MessageStatus::Failed)
        );
    }
}
