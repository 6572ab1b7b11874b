//! # corral-engine
//!
//! The session orchestrator. Each session runs a small state machine
//! (`starting → running_hooks → waiting_for_input ⇄ running`, plus the
//! question and plan waits) over whichever [`ExecutionBackend`] is
//! configured, and reports every change to its collaborators.
//!
//! [`ExecutionBackend`]: corral_core::backend::ExecutionBackend

#![deny(unsafe_code)]

pub mod collaborators;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod question;
mod turn;

pub use collaborators::{ChannelBroadcaster, CommandHooks, InMemoryMessageCache, InMemoryMetadataStore, NoopHooks};
pub use error::EngineError;
pub use orchestrator::{compose_system_prompt, Collaborators, Orchestrator, StartOptions};
pub use plan::PlanMatcher;
