//! rakerunner daemon crate.

pub mod channel;
pub mod controller;
pub mod daemon_log;
pub mod daemon_loop;
pub mod lifecycle;
pub mod observer;
pub mod runner;
pub mod runtime;
pub mod state;

#[cfg(test)]
pub(crate) mod fake_world;

pub use channel::*;
pub use controller::*;
pub use daemon_log::*;
pub use daemon_loop::*;
pub use lifecycle::*;
pub use observer::*;
pub use runner::*;
pub use runtime::*;
pub use state::*;
