use std::time::Duration;

use thiserror::Error;

use crate::form::FieldKind;
use crate::fulfillment::Capability;

/// Failure reported by a transport while starting or completing a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("agent reported failure: {0}")]
    Remote(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("run did not complete within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("run channel closed before a completion was reported")]
    Closed,
}

impl TransportError {
    /// Returns true when the failure leaves the task unusable for further runs.
    ///
    /// Network, remote, timeout, and closed-channel failures leave the task
    /// resumable so the user can resubmit.
    #[must_use]
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FulfillmentError {
    #[error("{capability} fulfillment unavailable: {reason}")]
    Unavailable {
        capability: Capability,
        reason: String,
    },

    #[error("{capability} fulfillment supports exactly one demand, got {found}")]
    UnsupportedDemandCount { capability: Capability, found: usize },

    #[error("failed to resolve fulfillments: {0}")]
    Resolver(String),
}

/// Structural or value-level problem with a form definition or response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("form id must not be empty")]
    EmptyId,

    #[error("form '{form_id}' must declare at least one field")]
    EmptyFields { form_id: String },

    #[error("form '{form_id}' has columns={value}; expected 1..=4")]
    ColumnsOutOfRange { form_id: String, value: u8 },

    #[error("field '{field_id}' has col_span={value}; expected 1..=4")]
    ColSpanOutOfRange { field_id: String, value: u8 },

    #[error("multiselect field '{field_id}' must declare at least one option")]
    EmptyOptions { field_id: String },

    #[error("form declares field id '{field_id}' more than once")]
    DuplicateFieldId { field_id: String },

    #[error("form response id '{found}' does not match pending form '{expected}'")]
    IdMismatch { expected: String, found: String },

    #[error("field '{field_id}' expects a {expected} value, got {found}")]
    ValueTypeMismatch {
        field_id: String,
        expected: FieldKind,
        found: FieldKind,
    },

    #[error("field '{field_id}' has no option '{option}'")]
    UnknownOption { field_id: String, option: String },

    #[error("required field '{field_id}' has no value")]
    MissingRequired { field_id: String },
}
