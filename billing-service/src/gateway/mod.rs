//! GePG gateway integration: payload composition/parsing, signing and the
//! HTTP client.

pub mod client;
pub mod payload;
pub mod signer;

pub use client::GatewayClient;
pub use payload::{
    ACK_SUCCESS_CODE, Acknowledgement, ControlNumberResponse, PaymentNotification, PmtTrxDtl,
    ProviderCodes, ReconciliationResponse,
};
pub use signer::{HmacSigner, PayloadSigner};
