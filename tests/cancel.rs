mod support;

use std::time::Duration;

use agent_chat::{RunError, RunInput, RunOutcome, RunPhase};
use agent_protocol::{Part, TaskId};
use agent_protocol_mock::{CancelBehavior, Gate, RunScript, ScriptOutcome, ScriptedTransport};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use task_store::{MessageStatus, TaskState};

use support::{agent_message, agent_text, only_task, orchestrator, transport, wait_until};

fn hanging_run(task_id: &str, gate: &Gate) -> RunScript {
    RunScript::new(ScriptOutcome::Complete)
        .with_server_task_id(task_id)
        .update(vec![Part::text("t", "Working on it")])
        .wait(gate)
        .update(vec![Part::text("t", "Working on it... done")])
}

#[tokio::test]
async fn cancel_mid_stream_settles_locally_and_frees_the_task() {
    let gate = Gate::new();
    let transport = Arc::new(
        ScriptedTransport::new([
            hanging_run("trip", &gate),
            RunScript::new(ScriptOutcome::Complete).update(vec![Part::text("t", "Fresh start")]),
        ])
        .with_cancel_behavior(CancelBehavior::NeverRespond),
    );
    let orchestrator = orchestrator(&transport);

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("Plan a trip")).await }
    });
    wait_until(|| agent_text(&orchestrator).as_deref() == Some("Working on it")).await;

    orchestrator.cancel().await.expect("cancel in-flight run");

    let outcome = run.await.expect("run task").expect("canceled run is not an error");
    assert_eq!(
        outcome,
        RunOutcome::Aborted {
            task_id: TaskId::new("trip")
        }
    );

    let task = only_task(&orchestrator);
    assert_eq!(task.state, TaskState::Canceled);
    let agent = agent_message(&task);
    assert_eq!(agent.status, Some(MessageStatus::Aborted));
    assert_eq!(agent.text(), "Working on it");
    assert_eq!(orchestrator.phase(&task.id), RunPhase::Aborted);
    assert_eq!(transport.cancel_count(), 1);

    orchestrator
        .run(RunInput::text("Try again").for_task(task.id.clone()))
        .await
        .expect("next run succeeds although the remote cancel never answered");
    assert_eq!(only_task(&orchestrator).state, TaskState::Completed);
}

#[tokio::test]
async fn updates_after_cancel_are_not_applied() {
    let gate = Gate::new();
    let transport = transport([hanging_run("late", &gate)]);
    let orchestrator = orchestrator(&transport);

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("go")).await }
    });
    wait_until(|| orchestrator.is_task_pending(&TaskId::new("late"))).await;

    orchestrator
        .cancel_task(&TaskId::new("late"))
        .await
        .expect("cancel");
    gate.open();
    run.await.expect("run task").expect("aborted");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let task = only_task(&orchestrator);
    assert_eq!(agent_message(&task).text(), "Working on it");
    assert_eq!(agent_message(&task).status, Some(MessageStatus::Aborted));
}

#[tokio::test]
async fn cancel_without_a_run_is_rejected() {
    let transport = transport([]);
    let orchestrator = orchestrator(&transport);

    assert_matches!(orchestrator.cancel().await, Err(RunError::NoRunInProgress));
    assert_matches!(
        orchestrator.cancel_task(&TaskId::new("idle")).await,
        Err(RunError::NoRunInProgress)
    );
}

#[tokio::test]
async fn rejected_remote_cancel_does_not_roll_back_local_state() {
    let gate = Gate::new();
    let transport = Arc::new(
        ScriptedTransport::new([hanging_run("stubborn", &gate)])
            .with_cancel_behavior(CancelBehavior::Reject),
    );
    let orchestrator = orchestrator(&transport);

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("go")).await }
    });
    wait_until(|| orchestrator.is_task_pending(&TaskId::new("stubborn"))).await;

    orchestrator.cancel().await.expect("local cancel succeeds");
    run.await.expect("run task").expect("aborted");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(only_task(&orchestrator).state, TaskState::Canceled);
    assert_eq!(transport.cancel_count(), 1);
}

#[tokio::test]
async fn cancel_targets_the_most_recent_run() {
    let first_gate = Gate::new();
    let second_gate = Gate::new();
    let transport = transport([hanging_run("older", &first_gate), hanging_run("newer", &second_gate)]);
    let orchestrator = orchestrator(&transport);

    let older = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("first")).await }
    });
    wait_until(|| orchestrator.is_task_pending(&TaskId::new("older"))).await;
    let newer = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("second")).await }
    });
    wait_until(|| orchestrator.is_task_pending(&TaskId::new("newer"))).await;

    orchestrator.cancel().await.expect("cancel");

    assert_matches!(
        newer.await.expect("newer task"),
        Ok(RunOutcome::Aborted { task_id }) if task_id == TaskId::new("newer")
    );
    assert!(orchestrator.is_task_pending(&TaskId::new("older")));

    first_gate.open();
    assert_matches!(
        older.await.expect("older task"),
        Ok(RunOutcome::Completed { .. })
    );
}

#[tokio::test]
async fn dropped_run_future_releases_the_task() {
    let gate = Gate::new();
    let transport = transport([
        hanging_run("dropped", &gate),
        RunScript::new(ScriptOutcome::Complete),
    ]);
    let orchestrator = orchestrator(&transport);

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(RunInput::text("go")).await }
    });
    wait_until(|| orchestrator.is_task_pending(&TaskId::new("dropped"))).await;

    run.abort();
    let _ = run.await;

    assert!(!orchestrator.is_pending());
    let task = only_task(&orchestrator);
    assert_eq!(task.state, TaskState::Canceled);
    assert_eq!(transport.cancel_count(), 1);

    orchestrator
        .run(RunInput::text("again").for_task(task.id))
        .await
        .expect("task is free again");
}
