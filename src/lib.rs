//! Client-side core for streamed conversations with a remote agent.
//!
//! A [`RunOrchestrator`] drives one exchange at a time per task: it records the
//! user's submission, starts a run through an [`agent_protocol::Transport`],
//! folds the streamed fragments into the agent's message with a
//! [`PartAccumulator`], and settles the task when the agent completes, asks
//! for a form, fails, or is canceled.
//!
//! # Public API Overview
//! - Start, continue, and cancel runs with [`RunOrchestrator`] and [`RunInput`].
//! - Answer agent forms by passing a [`agent_protocol::FormResponse`] in
//!   [`RunInput::form`]; see [`form`] for prefilling and parsing helpers.
//! - Read conversation state through [`RunOrchestrator::snapshot`].
//! - Configure from the environment with [`EnvConfig`] and install logging
//!   with [`logging::init_logging`].

pub mod accumulator;
pub mod config;
pub mod error;
pub mod form;
pub mod logging;
mod orchestrator;

pub use accumulator::PartAccumulator;
pub use config::{EnvConfig, OrchestratorConfig};
pub use error::RunError;
pub use logging::{init_logging, LogConfig};
pub use orchestrator::{RunInput, RunOrchestrator, RunOutcome, RunPhase, RunStats};
