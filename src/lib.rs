pub mod config;
pub mod detector;
pub mod dispatch;
pub mod kernel;
pub mod messaging;
pub mod runtime;
pub mod services;
pub mod store;

pub use kernel::tracker::Tracker;
pub use runtime::{Input, Notice, Runtime, RuntimeHandle};
