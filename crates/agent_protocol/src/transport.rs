//! Transport contract consumed by the run orchestrator.
//!
//! A run has two phases: a stream of [`RunUpdate`]s delivered through a
//! [`Subscription`], and a single terminal [`RunResult`] delivered through a
//! [`Completion`]. Transports build both ends with [`run_channel`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::form::{FormRender, FormResponse};
use crate::fulfillment::Fulfillments;
use crate::ids::{ContextId, MessageId, TaskId};
use crate::part::Part;

/// Batch of parts delivered during the streaming phase of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub task_id: TaskId,
    pub parts: Vec<Part>,
}

/// Reason a run stopped without finishing the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnfinishedResult {
    FormRequired { task_id: TaskId, form: FormRender },
}

/// Terminal result of a run: `Ok(None)` when the agent finished the task.
pub type RunResult = Result<Option<UnfinishedResult>, TransportError>;

/// User message sent to the agent when a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub id: MessageId,
    pub parts: Vec<Part>,
}

pub struct StartRequest {
    pub message: OutgoingMessage,
    pub context_id: ContextId,
    pub fulfillments: Arc<dyn Fulfillments>,
    /// Set when continuing an existing task.
    pub task_id: Option<TaskId>,
    pub form_response: Option<FormResponse>,
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("message", &self.message)
            .field("context_id", &self.context_id)
            .field("task_id", &self.task_id)
            .field("form_response", &self.form_response)
            .finish_non_exhaustive()
    }
}

/// Remote-side cancellation for one run.
pub trait RunCanceller: Send + Sync + 'static {
    fn cancel(&self) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Starts streamed runs against a remote agent.
pub trait Transport: Send + Sync + 'static {
    fn start(&self, request: StartRequest) -> Result<RunHandle, TransportError>;
}

/// Handle to one in-flight run.
pub struct RunHandle {
    task_id: Option<TaskId>,
    updates: Option<mpsc::UnboundedReceiver<RunUpdate>>,
    done: Option<oneshot::Receiver<RunResult>>,
    canceller: Arc<dyn RunCanceller>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("task_id", &self.task_id)
            .field("subscribed", &self.updates.is_none())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub fn set_task_id(&mut self, task_id: TaskId) {
        self.task_id = Some(task_id);
    }

    /// Takes the update stream. Runs have a single subscriber; later calls return `None`.
    pub fn subscribe(&mut self) -> Option<Subscription> {
        self.updates.take().map(|receiver| Subscription { receiver })
    }

    /// Takes the completion future. Later calls return `None`.
    pub fn completion(&mut self) -> Option<Completion> {
        self.done.take().map(|receiver| Completion { receiver })
    }

    #[must_use]
    pub fn canceller(&self) -> Arc<dyn RunCanceller> {
        Arc::clone(&self.canceller)
    }

    pub fn cancel(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        self.canceller.cancel()
    }
}

/// Receiving end of a run's update stream.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<RunUpdate>,
}

impl Subscription {
    /// Waits for the next update. Returns `None` once the transport stops streaming.
    pub async fn next(&mut self) -> Option<RunUpdate> {
        self.receiver.recv().await
    }

    /// Returns an already-buffered update without waiting.
    pub fn try_next(&mut self) -> Option<RunUpdate> {
        self.receiver.try_recv().ok()
    }

    /// Stops delivery. The transport observes this through [`RunSink::is_subscribed`].
    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Future resolving to the terminal result of a run.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<RunResult>,
}

impl Future for Completion {
    type Output = RunResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TransportError::Closed)))
    }
}

/// Transport-side end of a run.
#[derive(Debug)]
pub struct RunSink {
    updates: mpsc::UnboundedSender<RunUpdate>,
    done: oneshot::Sender<RunResult>,
}

impl RunSink {
    /// Delivers an update. Returns false once the orchestrator has unsubscribed.
    pub fn emit(&self, update: RunUpdate) -> bool {
        self.updates.send(update).is_ok()
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        !self.updates.is_closed()
    }

    /// Ends the update stream, then resolves the completion.
    pub fn finish(self, result: RunResult) {
        let Self { updates, done } = self;
        drop(updates);
        let _ = done.send(result);
    }
}

/// Builds both ends of a run: the sink the transport drives and the handle it returns.
#[must_use]
pub fn run_channel(
    task_id: Option<TaskId>,
    canceller: Arc<dyn RunCanceller>,
) -> (RunSink, RunHandle) {
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    (
        RunSink {
            updates: updates_tx,
            done: done_tx,
        },
        RunHandle {
            task_id,
            updates: Some(updates_rx),
            done: Some(done_rx),
            canceller,
        },
    )
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;

    struct NoopCanceller;

    impl RunCanceller for NoopCanceller {
        fn cancel(&self) -> BoxFuture<'static, Result<(), TransportError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn update(task_id: &str, text: &str) -> RunUpdate {
        RunUpdate {
            task_id: TaskId::new(task_id),
            parts: vec![Part::text("t", text)],
        }
    }

    #[tokio::test]
    async fn updates_arrive_in_order_and_stream_ends_before_completion() {
        let (sink, mut handle) = run_channel(None, Arc::new(NoopCanceller));
        let mut subscription = handle.subscribe().expect("first subscribe succeeds");
        assert!(handle.subscribe().is_none());

        assert!(sink.emit(update("task-1", "a")));
        assert!(sink.emit(update("task-1", "b")));
        sink.finish(Ok(None));

        assert_eq!(subscription.next().await, Some(update("task-1", "a")));
        assert_eq!(subscription.next().await, Some(update("task-1", "b")));
        assert_eq!(subscription.next().await, None);

        let completion = handle.completion().expect("completion available");
        assert_eq!(completion.await, Ok(None));
    }

    #[tokio::test]
    async fn unsubscribe_is_visible_to_the_sink() {
        let (sink, mut handle) = run_channel(None, Arc::new(NoopCanceller));
        let subscription = handle.subscribe().expect("subscribe");
        assert!(sink.is_subscribed());

        subscription.unsubscribe();

        assert!(!sink.is_subscribed());
        assert!(!sink.emit(update("task-1", "late")));
    }

    #[tokio::test]
    async fn dropped_sink_resolves_completion_as_closed() {
        let (sink, mut handle) = run_channel(Some(TaskId::new("task-9")), Arc::new(NoopCanceller));
        assert_eq!(handle.task_id(), Some(&TaskId::new("task-9")));
        drop(sink);

        let completion = handle.completion().expect("completion available");
        assert_eq!(completion.await, Err(TransportError::Closed));
    }

    #[test]
    fn task_id_can_be_back_filled() {
        let (_sink, mut handle) = run_channel(None, Arc::new(NoopCanceller));
        assert!(handle.task_id().is_none());
        handle.set_task_id(TaskId::new("server-task"));
        assert_eq!(handle.task_id().map(TaskId::as_str), Some("server-task"));
        assert!(handle.cancel().now_or_never().is_some());
    }
}
