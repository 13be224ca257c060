#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_chat::{OrchestratorConfig, RunOrchestrator};
use agent_protocol::{
    FulfillmentError, FulfillmentResolver, Fulfillments, PlatformFulfillments, StaticResolver,
    TaskId, Transport,
};
use agent_protocol_mock::{RunScript, ScriptedTransport};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;
use task_store::{Message, Role, Task};

pub fn orchestrator(transport: &Arc<ScriptedTransport>) -> RunOrchestrator {
    orchestrator_with_config(transport, OrchestratorConfig::default())
}

pub fn orchestrator_with_config(
    transport: &Arc<ScriptedTransport>,
    config: OrchestratorConfig,
) -> RunOrchestrator {
    let transport: Arc<dyn Transport> = transport.clone();
    RunOrchestrator::with_config(
        transport,
        Arc::new(StaticResolver::new(PlatformFulfillments::new("test-token"))),
        config,
    )
}

pub fn transport(scripts: impl IntoIterator<Item = RunScript>) -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new(scripts))
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition should hold within two seconds");
}

pub fn only_task(orchestrator: &RunOrchestrator) -> Task {
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.tasks.len(), 1, "expected exactly one task");
    snapshot.tasks[0].clone()
}

pub fn agent_message(task: &Task) -> &Message {
    task.last_agent_message().expect("task has an agent message")
}

pub fn agent_text(orchestrator: &RunOrchestrator) -> Option<String> {
    orchestrator
        .snapshot()
        .tasks
        .last()
        .and_then(|task| task.last_agent_message().map(Message::text))
}

pub fn roles(task: &Task) -> Vec<Role> {
    task.messages.iter().map(|message| message.role).collect()
}

pub fn task_id(value: &str) -> TaskId {
    TaskId::new(value)
}

/// Resolver that counts calls and can be told to fail.
#[derive(Debug, Default)]
pub struct CountingResolver {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl CountingResolver {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FulfillmentResolver for CountingResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<Arc<dyn Fulfillments>, FulfillmentError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(FulfillmentError::Resolver("platform unreachable".to_string()))
        } else {
            Ok(Arc::new(PlatformFulfillments::new("counted")) as Arc<dyn Fulfillments>)
        };
        async move { result }.boxed()
    }
}

/// Resolver that holds each resolve until [`GatedResolver::release`] is called.
#[derive(Debug, Default)]
pub struct GatedResolver {
    release: Notify,
}

impl GatedResolver {
    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl FulfillmentResolver for GatedResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<Arc<dyn Fulfillments>, FulfillmentError>> {
        async move {
            self.release.notified().await;
            Ok(Arc::new(PlatformFulfillments::new("gated")) as Arc<dyn Fulfillments>)
        }
        .boxed()
    }
}
