//! HTTP handlers: idempotent bill APIs for integrating systems, the three
//! gateway callback endpoints, reconciliation operations and health checks.

pub mod bills;
pub mod callbacks;
pub mod health;
pub mod reconciliation;
