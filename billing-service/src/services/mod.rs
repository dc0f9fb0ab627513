pub mod delivery;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod postgres;
pub mod store;

pub use delivery::{DocumentDelivery, EmailDelivery, NoopDelivery};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{NoopNotifier, OperatorNotifier, SmtpNotifier};
pub use postgres::PgStore;
pub use store::{
    BillingStore, ControlNumberOutcome, IdempotencyOutcome, PaymentOutcome,
};
