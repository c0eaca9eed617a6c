//! Route handlers for the HTTP API.

pub mod events;
pub mod executions;
pub mod health;
pub mod jobs;
pub mod pipeline;
