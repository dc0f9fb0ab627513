//! GePG payment-gateway integration and reconciliation service.
//!
//! Integrates the billing platform with the national payment gateway: bill
//! issuance and control-number allocation, idempotent payment-notification
//! ingestion, and daily settlement reconciliation with auto-repair.

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod reconciliation;
pub mod services;
pub mod startup;
pub mod workers;

pub use startup::{AppState, Application};
