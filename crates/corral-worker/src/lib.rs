//! # corral-worker
//!
//! The HTTP process that runs inside each container or cloud app. It serves
//! the worker surface the remote backends talk to, streaming turns as
//! server-sent events in the native or the task/message dialect (chosen per
//! request by the `x-corral-protocol` header).

#![deny(unsafe_code)]

pub mod events;
pub mod handlers;
pub mod server;

pub use server::{build_router, start, AppState, WorkerConfig, WorkerHandle};
