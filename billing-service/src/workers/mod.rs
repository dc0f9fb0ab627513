//! Background job execution: a bounded queue, a worker pool with
//! at-least-once delivery and per-job retry policies, and the daily
//! reconciliation trigger.

pub mod jobs;
pub mod orchestrator;
pub mod scheduler;

pub use jobs::{Job, JobContext, JobError};
pub use orchestrator::{JobQueue, WorkerOrchestrator};
pub use scheduler::{spawn_reconciliation_trigger, trigger_due_reconciliations};
