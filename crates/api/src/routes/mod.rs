//! HTTP route handlers.

pub mod definitions;
pub mod health;
pub mod metrics;
pub mod sagas;
