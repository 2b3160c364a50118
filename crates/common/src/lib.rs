//! Common crate
//!
//! Shared identifiers and error handling for Igloo.
//!
//! # Example
//! ```rust
//! use igloo_common::TaskId;
//! let task_id: TaskId = "q1.2.0.0".parse().unwrap();
//! assert_eq!(task_id.stage_id().0, 2);
//! ```

pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::{DynamicFilterId, OutputBufferId, PlanNodeId, QueryId, StageId, TaskId};
