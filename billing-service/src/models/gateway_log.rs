//! Payment gateway request ledger.
//!
//! One row per `(req_id, req_type)` pair; rows are created when a request is
//! issued (or an unsolicited callback first seen) and updated as
//! acknowledgements and responses arrive. Rows are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Gateway request types, stored with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    ControlNumberRequest,
    ControlNumberReuse,
    ControlNumberChange,
    CancellationRequest,
    PaymentNotification,
    ReconciliationRequest,
    BillCancellation,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlNumberRequest => "1",
            Self::ControlNumberReuse => "2",
            Self::ControlNumberChange => "3",
            Self::CancellationRequest => "4",
            Self::PaymentNotification => "5",
            Self::ReconciliationRequest => "6",
            Self::BillCancellation => "7",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "2" => Self::ControlNumberReuse,
            "3" => Self::ControlNumberChange,
            "4" => Self::CancellationRequest,
            "5" => Self::PaymentNotification,
            "6" => Self::ReconciliationRequest,
            "7" => Self::BillCancellation,
            _ => Self::ControlNumberRequest,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ControlNumberRequest => "Bill Control Number Request",
            Self::ControlNumberReuse => "Bill Control Number Reuse Request",
            Self::ControlNumberChange => "Bill Control Number Change Request",
            Self::CancellationRequest => "Bill Control Number Cancellation Request",
            Self::PaymentNotification => "Bill Payment Notification",
            Self::ReconciliationRequest => "Bill Payment Reconciliation Request",
            Self::BillCancellation => "Bill Cancellation Request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Pending,
    Success,
    Error,
    Retrying,
    Failed,
    Cancelled,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Retrying => "RETRYING",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SUCCESS" => Self::Success,
            "ERROR" => Self::Error,
            "RETRYING" => Self::Retrying,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentGatewayLog {
    pub log_id: Uuid,
    pub req_id: String,
    pub req_type: String,
    pub bill_id: Option<String>,
    pub status: String,
    pub status_desc: String,
    /// Raw outbound payload, kept verbatim for audit and replay.
    pub req_data: Option<String>,
    /// Raw synchronous acknowledgement to our request.
    pub req_ack: Option<String>,
    /// Raw asynchronous response (or inbound notification) payload.
    pub res_data: Option<String>,
    /// Raw acknowledgement we returned for the response.
    pub res_ack: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentGatewayLog {
    pub fn new(req_id: &str, req_type: RequestType, bill_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            log_id: Uuid::new_v4(),
            req_id: req_id.to_string(),
            req_type: req_type.as_str().to_string(),
            bill_id: bill_id.map(|b| b.to_string()),
            status: LogStatus::Pending.as_str().to_string(),
            status_desc: String::new(),
            req_data: None,
            req_ack: None,
            res_data: None,
            res_ack: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_round_trip() {
        for rt in [
            RequestType::ControlNumberRequest,
            RequestType::ControlNumberReuse,
            RequestType::ControlNumberChange,
            RequestType::CancellationRequest,
            RequestType::PaymentNotification,
            RequestType::ReconciliationRequest,
            RequestType::BillCancellation,
        ] {
            assert_eq!(RequestType::from_str(rt.as_str()), rt);
        }
    }

    #[test]
    fn unknown_status_defaults_to_pending() {
        assert_eq!(LogStatus::from_str("???"), LogStatus::Pending);
    }
}
