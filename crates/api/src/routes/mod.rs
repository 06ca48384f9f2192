//! HTTP handlers.

pub mod business;
pub mod health;
pub mod metrics;
pub mod resources;
