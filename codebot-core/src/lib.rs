//! Domain model and persistence for the review follow-up engine.
//!
//! Everything in this crate is deterministic: cursor math, lifecycle
//! transitions, branch naming and thread reconstruction are pure functions,
//! and the [`store::EventStore`] trait is the only seam with side effects.

pub mod cursor;
pub mod lifecycle;
pub mod model;
pub mod naming;
pub mod store;
pub mod task;
pub mod thread;

pub use model::*;
pub use task::{Task, TaskError, TaskResult, TaskStatus};
