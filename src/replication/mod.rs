//! Replication of images and charts between registries.
//!
//! A [`policy::Policy`] names a source and a destination registry. Running it
//! goes through a [`flow::Flow`] that lists and filters source resources,
//! creates one task per resource pair and submits one job per task through
//! the [`scheduler::Scheduler`]. Jobs run a [`transfer::Transfer`] and report
//! back through status hooks handled by the [`controller::ReplicationController`].

pub mod adapter;
pub mod controller;
pub mod event;
pub mod execution;
pub mod filter;
pub mod flow;
pub mod jobservice;
pub mod model;
pub mod policy;
pub mod scheduler;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
