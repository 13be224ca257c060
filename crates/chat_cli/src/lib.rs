//! Line-oriented chat front-end.
//!
//! Plain lines are sent to the agent; slash commands control the
//! conversation. The binary talks to the scripted trip-planner transport, so
//! it runs without network access. Logging goes to stderr and is filtered by
//! `AGENT_CHAT_LOG`.

pub mod app;
pub mod commands;
