//! Shared vocabulary between a conversation client and a remote agent.
//!
//! This crate defines the message-part model, the form extension wire shapes,
//! and the two capabilities a run orchestrator consumes: a [`Transport`] that
//! starts streamed runs and a [`FulfillmentResolver`] that supplies run-scoped
//! capability grants. It contains no orchestration state and no wire transport.

pub mod error;
pub mod form;
pub mod fulfillment;
pub mod ids;
pub mod part;
pub mod transport;

pub use error::{FormError, FulfillmentError, TransportError};
pub use form::{
    CheckboxField, DateField, FieldKind, FieldValue, FileField, FileValue, FormField, FormRender,
    FormResponse, MultiSelectField, OptionItem, TextField,
};
pub use fulfillment::{
    Capability, FulfillmentResolver, Fulfillments, LlmDemand, LlmDemands, LlmFulfillment,
    LlmFulfillments, McpDemand, McpDemands, McpFulfillment, McpFulfillments, McpTransport,
    OAuthDemand, OAuthDemands, OAuthFulfillment, OAuthFulfillments, PlatformFulfillments,
    StaticResolver,
};
pub use ids::{ContextId, MessageId, TaskId};
pub use part::{
    AuthPart, DataPart, FilePart, Part, PartKind, SourcePart, TextPart, TrajectoryPart, Transform,
    TransformPart,
};
pub use transport::{
    run_channel, Completion, OutgoingMessage, RunCanceller, RunHandle, RunResult, RunSink,
    RunUpdate, StartRequest, Subscription, Transport, UnfinishedResult,
};
