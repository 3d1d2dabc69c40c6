pub mod executions;
pub mod models;
