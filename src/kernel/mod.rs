//! Tracking kernel.
//!
//! # INVARIANT
//! Nothing under `kernel` performs I/O, sleeps or reads the clock. Every
//! entry point takes `now` and returns [`scheduler::SideEffect`]s for the
//! driver to execute.

pub mod event;
pub mod guard;
pub mod scheduler;
pub mod state;
pub mod time;
pub mod tracker;
