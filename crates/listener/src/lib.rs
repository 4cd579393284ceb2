//! Turns build lifecycle events into commit status publishing tasks.

mod build_store;
pub mod gate;
mod listener;
mod problems;
mod task;

pub use build_store::{BuildStore, SharedBuildStore};
pub use listener::CommitStatusPublisherListener;
pub use problems::{ProblemAggregator, publish_failure_description};
pub use task::PublishTaskHandler;

#[cfg(test)]
mod test_utils;
