//! Tracing setup shared by processes embedding the queue.
//!
//! Queue operations emit spans named after the strategy method with `table`,
//! `queue` and `task_id` fields; the subscriber installed here decides where
//! they go.

pub mod tracing;

pub use crate::tracing::{init, init_for_tests};
