//! Gateway callback endpoints.
//!
//! The gateway requires a synchronous, well-formed, signed acknowledgement
//! with HTTP 200 regardless of what later happens to the payload. Each
//! handler therefore only parses identifiers, pins the ledger row, enqueues
//! the processing job and answers — it never surfaces internal errors to the
//! gateway.

use crate::gateway::payload::{self, ACK_SUCCESS_CODE};
use crate::gateway::signer::PayloadSigner;
use crate::models::{PaymentGatewayLog, RequestType};
use crate::services::store::BillingStore;
use crate::startup::AppState;
use crate::workers::Job;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

/// Ack status code for payloads we could not accept (bad envelope or, in
/// strict mode, a failed signature check).
const ACK_REJECT_CODE: &str = "7201";

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

/// Last-resort acknowledgement when even composing a signed ack fails.
fn fallback_ack() -> Response {
    xml_response(format!(
        "<Gepg><billSubResAck><AckId>{}</AckId><ResId></ResId><AckStsCode>{}</AckStsCode></billSubResAck></Gepg>",
        Uuid::new_v4(),
        ACK_REJECT_CODE
    ))
}

/// Verify the envelope signature. Returns false only when strict mode is on
/// and the signature is absent or wrong; otherwise mismatches are logged and
/// processing continues.
fn signature_ok(state: &AppState, inner: &str, signature: Option<&str>) -> bool {
    let verified = signature
        .map(|sig| state.signer.verify(inner, sig).unwrap_or(false))
        .unwrap_or(false);

    if !verified {
        tracing::warn!("Callback signature missing or not verifiable");
        if state.config.gepg.require_valid_signature {
            return false;
        }
    }
    verified || !state.config.gepg.require_valid_signature
}

async fn pin_ledger_row(
    state: &AppState,
    req_id: &str,
    req_type: RequestType,
    bill_id: Option<&str>,
    raw: &str,
) {
    if req_id.is_empty() {
        return;
    }
    let log = PaymentGatewayLog::new(req_id, req_type, bill_id);
    if let Err(e) = state.store.get_or_create_log(log).await {
        tracing::error!(error = %e, req_id = req_id, "Failed to pin ledger row for callback");
        return;
    }
    if let Err(e) = state.store.set_log_res_data(req_id, req_type, raw).await {
        tracing::error!(error = %e, req_id = req_id, "Failed to record callback payload");
    }
}

async fn store_res_ack(state: &AppState, req_id: &str, req_type: RequestType, ack: &str) {
    if req_id.is_empty() {
        return;
    }
    if let Err(e) = state.store.set_log_res_ack(req_id, req_type, ack).await {
        tracing::error!(error = %e, req_id = req_id, "Failed to record returned ack");
    }
}

/// Control-number response callback. Also receives bill cancellation
/// responses, distinguished by the inner document root.
pub async fn control_number_response(State(state): State<AppState>, body: String) -> Response {
    let (inner, signature) = match payload::split_envelope(&body) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed control number callback envelope");
            return fallback_ack();
        }
    };

    let accepted = signature_ok(&state, &inner, signature.as_deref());

    if inner.starts_with("<billCanclRes") {
        return cancellation_response(state, body, inner, accepted).await;
    }

    let (res_id, req_id) = match payload::parse_control_number_response(&body) {
        Ok(res) => (res.res_id, res.req_id),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable control number response");
            (String::new(), String::new())
        }
    };

    let ack_code = if accepted && !req_id.is_empty() {
        ACK_SUCCESS_CODE
    } else {
        ACK_REJECT_CODE
    };

    if ack_code == ACK_SUCCESS_CODE {
        pin_ledger_row(&state, &req_id, RequestType::ControlNumberRequest, None, &body).await;
        if let Err(e) = state
            .queue
            .enqueue(Job::ProcessControlNumberResponse { raw: body.clone() })
        {
            tracing::error!(error = %e, req_id = %req_id, "Failed to enqueue control number processing");
        }
    }

    let ack = match payload::compose_submission_response_ack(
        &Uuid::new_v4().to_string(),
        &res_id,
        ack_code,
        state.signer.as_ref(),
    ) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(error = %e, "Failed to compose submission response ack");
            return fallback_ack();
        }
    };

    store_res_ack(&state, &req_id, RequestType::ControlNumberRequest, &ack).await;
    xml_response(ack)
}

async fn cancellation_response(
    state: AppState,
    body: String,
    _inner: String,
    accepted: bool,
) -> Response {
    let (res_id, req_id) = match payload::parse_cancellation_response(&body) {
        Ok(res) => (res.res_id, res.req_id),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable cancellation response");
            (String::new(), String::new())
        }
    };

    let ack_code = if accepted && !req_id.is_empty() {
        ACK_SUCCESS_CODE
    } else {
        ACK_REJECT_CODE
    };

    if ack_code == ACK_SUCCESS_CODE {
        pin_ledger_row(&state, &req_id, RequestType::CancellationRequest, None, &body).await;
        if let Err(e) = state
            .queue
            .enqueue(Job::ProcessCancellationResponse { raw: body.clone() })
        {
            tracing::error!(error = %e, req_id = %req_id, "Failed to enqueue cancellation processing");
        }
    }

    let ack = match payload::compose_submission_response_ack(
        &Uuid::new_v4().to_string(),
        &res_id,
        ack_code,
        state.signer.as_ref(),
    ) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(error = %e, "Failed to compose cancellation response ack");
            return fallback_ack();
        }
    };

    store_res_ack(&state, &req_id, RequestType::CancellationRequest, &ack).await;
    xml_response(ack)
}

/// Payment notification callback.
pub async fn payment_notification(State(state): State<AppState>, body: String) -> Response {
    let accepted = match payload::split_envelope(&body) {
        Ok((inner, signature)) => signature_ok(&state, &inner, signature.as_deref()),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed payment callback envelope");
            return fallback_ack();
        }
    };

    let req_id = match payload::parse_payment_notification(&body) {
        Ok(notification) => notification.req_id,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable payment notification");
            String::new()
        }
    };

    let ack_code = if accepted && !req_id.is_empty() {
        ACK_SUCCESS_CODE
    } else {
        ACK_REJECT_CODE
    };

    if ack_code == ACK_SUCCESS_CODE {
        pin_ledger_row(&state, &req_id, RequestType::PaymentNotification, None, &body).await;
        if let Err(e) = state
            .queue
            .enqueue(Job::ProcessPaymentNotification { raw: body.clone() })
        {
            tracing::error!(error = %e, req_id = %req_id, "Failed to enqueue payment processing");
        }
    }

    let ack = match payload::compose_payment_notification_ack(
        &Uuid::new_v4().to_string(),
        &req_id,
        ack_code,
        state.signer.as_ref(),
    ) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(error = %e, "Failed to compose payment notification ack");
            return fallback_ack();
        }
    };

    store_res_ack(&state, &req_id, RequestType::PaymentNotification, &ack).await;
    xml_response(ack)
}

/// Reconciliation response callback.
pub async fn reconciliation_response(State(state): State<AppState>, body: String) -> Response {
    let accepted = match payload::split_envelope(&body) {
        Ok((inner, signature)) => signature_ok(&state, &inner, signature.as_deref()),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed reconciliation callback envelope");
            return fallback_ack();
        }
    };

    let (res_id, req_id) = match payload::parse_reconciliation_response(&body) {
        Ok(res) => (res.res_id, res.req_id),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable reconciliation response");
            (String::new(), String::new())
        }
    };

    let ack_code = if accepted && !req_id.is_empty() {
        ACK_SUCCESS_CODE
    } else {
        ACK_REJECT_CODE
    };

    if ack_code == ACK_SUCCESS_CODE {
        pin_ledger_row(&state, &req_id, RequestType::ReconciliationRequest, None, &body).await;
        if let Err(e) = state
            .queue
            .enqueue(Job::ProcessReconciliationResponse { raw: body.clone() })
        {
            tracing::error!(error = %e, req_id = %req_id, "Failed to enqueue reconciliation processing");
        }
    }

    let ack = match payload::compose_reconciliation_response_ack(
        &Uuid::new_v4().to_string(),
        &res_id,
        ack_code,
        state.signer.as_ref(),
    ) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(error = %e, "Failed to compose reconciliation response ack");
            return fallback_ack();
        }
    };

    store_res_ack(&state, &req_id, RequestType::ReconciliationRequest, &ack).await;
    xml_response(ack)
}
