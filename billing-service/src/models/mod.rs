//! Domain models for billing-service.

pub mod bill;
pub mod gateway_log;
pub mod payment;
pub mod reconciliation;

pub use bill::{
    Bill, BillItem, BillStatus, BillingDepartment, CancelStatus, CancelledBill, Customer,
    CustomerIdType, SystemInfo,
};
pub use gateway_log::{LogStatus, PaymentGatewayLog, RequestType};
pub use payment::{DeliveryLog, IdempotencyRecord, Payment};
pub use reconciliation::{
    CurrencyTotal, CurrencyTotals, MatchStatus, PaymentReconciliation, ReconciliationRun,
    RunStatus,
};
