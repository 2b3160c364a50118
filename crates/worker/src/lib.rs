//! Worker-side task execution for the Igloo query engine.
//!
//! A coordinator drives each [`task::SqlTask`] through [`SqlTaskManager`]:
//! it sends splits and output buffer layouts with `update_task`, long-polls
//! status, and pulls result pages from the task's [`buffer::OutputBuffer`]
//! with `get`/`acknowledge`. The execution engine plugs in through
//! [`task::ExecutionStarter`] and pushes pages into the same buffer.

pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod task;

pub use config::Settings;
pub use error::{Result, WorkerError};
pub use manager::SqlTaskManager;
