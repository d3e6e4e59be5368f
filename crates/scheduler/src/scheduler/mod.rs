//! Tasklet scheduler -- the single entry point for submissions and worker events.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, submission, cancellation, termination
//! - `events`: worker allocation, preemption, and report handling

mod core;
mod events;

pub use self::core::Scheduler;
