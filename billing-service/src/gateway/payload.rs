//! GePG XML payload composition and parsing.
//!
//! Every payload is a `<Gepg>` envelope holding one inner document followed
//! by a `signature` element covering the serialized inner document exactly.
//! Composition serializes the inner document first, signs that string, then
//! wraps it; parsing slices the inner document back out so the signature can
//! be checked against the same bytes.

use crate::gateway::signer::PayloadSigner;
use crate::models::{Bill, BillItem, CancelledBill, Customer};
use chrono::NaiveDate;
use quick_xml::{de::from_str, se::to_string_with_root};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

/// Acknowledgement status code meaning "accepted, final result follows".
pub const ACK_SUCCESS_CODE: &str = "7101";

/// Service-provider identification codes carried in every request.
#[derive(Debug, Clone)]
pub struct ProviderCodes {
    pub sp_grp_code: String,
    pub sp_code: String,
    pub sub_sp_code: String,
    pub sys_code: String,
}

fn xml_err(e: quick_xml::DeError) -> AppError {
    AppError::PayloadError(format!("XML parse error: {}", e))
}

fn ser_err(e: quick_xml::DeError) -> AppError {
    AppError::PayloadError(format!("XML serialize error: {}", e))
}

/// Wrap a serialized inner document and its signature into the envelope.
fn envelope(inner: &str, signature: &str) -> String {
    format!("<Gepg>{}<signature>{}</signature></Gepg>", inner, signature)
}

fn sign_and_wrap(
    root: &str,
    doc: &impl Serialize,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let inner = to_string_with_root(root, doc).map_err(ser_err)?;
    let signature = signer.sign(&inner)?;
    Ok(envelope(&inner, &signature))
}

/// Slice the inner document and signature back out of an envelope.
///
/// Returns `(inner_document, signature)`. The inner document is returned
/// verbatim, including its own tags, so signature verification sees exactly
/// the signed bytes.
pub fn split_envelope(xml: &str) -> Result<(String, Option<String>), AppError> {
    let trimmed = xml.trim();
    let body = trimmed
        .strip_prefix("<Gepg>")
        .and_then(|rest| rest.strip_suffix("</Gepg>"))
        .ok_or_else(|| AppError::PayloadError("missing Gepg envelope".to_string()))?;

    let signature = body.find("<signature>").and_then(|start| {
        body[start..]
            .find("</signature>")
            .map(|end| body[start + "<signature>".len()..start + end].to_string())
    });

    let inner_end = body.find("<signature>").unwrap_or(body.len());
    let inner = body[..inner_end].to_string();
    if inner.is_empty() {
        return Err(AppError::PayloadError("empty Gepg envelope".to_string()));
    }

    Ok((inner, signature))
}

// ============================================================================
// Outbound requests
// ============================================================================

#[derive(Debug, Serialize)]
struct BillSubReq {
    #[serde(rename = "BillHdr")]
    hdr: BillHdr,
    #[serde(rename = "BillDtls")]
    dtls: BillDtls,
}

#[derive(Debug, Serialize)]
struct BillHdr {
    #[serde(rename = "ReqId")]
    req_id: String,
    #[serde(rename = "SpGrpCode")]
    sp_grp_code: String,
    #[serde(rename = "SysCode")]
    sys_code: String,
    #[serde(rename = "BillTyp")]
    bill_typ: String,
    #[serde(rename = "PayTyp")]
    pay_typ: String,
    #[serde(rename = "GrpBillId")]
    grp_bill_id: String,
}

#[derive(Debug, Serialize)]
struct BillDtls {
    #[serde(rename = "BillDtl")]
    dtl: BillDtl,
}

#[derive(Debug, Serialize)]
struct BillDtl {
    #[serde(rename = "BillId")]
    bill_id: String,
    #[serde(rename = "SpCode")]
    sp_code: String,
    #[serde(rename = "CollCentCode")]
    coll_cent_code: String,
    #[serde(rename = "BillDesc")]
    bill_desc: String,
    #[serde(rename = "CustTin")]
    cust_tin: String,
    #[serde(rename = "CustId")]
    cust_id: String,
    #[serde(rename = "CustIdTyp")]
    cust_id_typ: String,
    #[serde(rename = "CustAccnt")]
    cust_accnt: String,
    #[serde(rename = "CustName")]
    cust_name: String,
    #[serde(rename = "CustCellNum")]
    cust_cell_num: String,
    #[serde(rename = "CustEmail")]
    cust_email: String,
    #[serde(rename = "BillGenDt")]
    bill_gen_dt: String,
    #[serde(rename = "BillExprDt")]
    bill_expr_dt: String,
    #[serde(rename = "BillGenBy")]
    bill_gen_by: String,
    #[serde(rename = "BillApprBy")]
    bill_appr_by: String,
    #[serde(rename = "BillAmt")]
    bill_amt: String,
    #[serde(rename = "BillEqvAmt")]
    bill_eqv_amt: String,
    #[serde(rename = "MinPayAmt")]
    min_pay_amt: String,
    #[serde(rename = "Ccy")]
    ccy: String,
    #[serde(rename = "ExchRate")]
    exch_rate: String,
    #[serde(rename = "BillPayOpt")]
    bill_pay_opt: String,
    #[serde(rename = "PayPlan")]
    pay_plan: String,
    #[serde(rename = "PayLimTyp")]
    pay_lim_typ: String,
    #[serde(rename = "PayLimAmt")]
    pay_lim_amt: String,
    #[serde(rename = "CollPsp")]
    coll_psp: String,
    #[serde(rename = "BillItems")]
    items: BillItems,
}

#[derive(Debug, Serialize)]
struct BillItems {
    #[serde(rename = "BillItem")]
    items: Vec<BillItemXml>,
}

#[derive(Debug, Serialize)]
struct BillItemXml {
    #[serde(rename = "RefBillId")]
    ref_bill_id: String,
    #[serde(rename = "SubSpCode")]
    sub_sp_code: String,
    #[serde(rename = "GfsCode")]
    gfs_code: String,
    #[serde(rename = "BillItemRef")]
    bill_item_ref: String,
    #[serde(rename = "UseItemRefOnPay")]
    use_item_ref_on_pay: String,
    #[serde(rename = "BillItemAmt")]
    bill_item_amt: String,
    #[serde(rename = "BillItemEqvAmt")]
    bill_item_eqv_amt: String,
    #[serde(rename = "CollSp")]
    coll_sp: String,
}

/// Compose the signed bill control-number request for a bill.
pub fn compose_bill_submission_request(
    req_id: &str,
    bill: &Bill,
    items: &[BillItem],
    customer: &Customer,
    coll_cent_code: &str,
    codes: &ProviderCodes,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = BillSubReq {
        hdr: BillHdr {
            req_id: req_id.to_string(),
            sp_grp_code: codes.sp_grp_code.clone(),
            sys_code: codes.sys_code.clone(),
            bill_typ: bill.bill_type.to_string(),
            pay_typ: bill.pay_type.to_string(),
            grp_bill_id: bill.group_bill_id.clone(),
        },
        dtls: BillDtls {
            dtl: BillDtl {
                bill_id: bill.bill_id.clone(),
                sp_code: codes.sp_code.clone(),
                coll_cent_code: coll_cent_code.to_string(),
                bill_desc: bill.description.clone().unwrap_or_default(),
                cust_tin: customer.tin.clone().unwrap_or_default(),
                cust_id: customer.id_num.clone(),
                cust_id_typ: customer.id_type.clone(),
                cust_accnt: customer.account_num.clone().unwrap_or_default(),
                cust_name: customer.full_name(),
                cust_cell_num: customer.cell_num.clone().unwrap_or_default(),
                cust_email: customer.email.clone().unwrap_or_default(),
                bill_gen_dt: bill.gen_date.format("%Y-%m-%dT%H:%M:%S").to_string(),
                bill_expr_dt: bill.expiry_date.format("%Y-%m-%dT%H:%M:%S").to_string(),
                bill_gen_by: bill.gen_by.clone().unwrap_or_default(),
                bill_appr_by: bill.appr_by.clone().unwrap_or_default(),
                bill_amt: format!("{:.2}", bill.amount),
                bill_eqv_amt: format!("{:.2}", bill.eqv_amount),
                min_pay_amt: format!("{:.2}", bill.min_amount),
                ccy: bill.currency.clone(),
                exch_rate: format!("{:.2}", bill.exchange_rate),
                bill_pay_opt: "1".to_string(),
                pay_plan: "1".to_string(),
                pay_lim_typ: "1".to_string(),
                pay_lim_amt: "0.00".to_string(),
                coll_psp: String::new(),
                items: BillItems {
                    items: items
                        .iter()
                        .map(|item| BillItemXml {
                            ref_bill_id: bill.bill_id.clone(),
                            sub_sp_code: codes.sub_sp_code.clone(),
                            gfs_code: item.gfs_code.clone(),
                            bill_item_ref: item.source_name.clone(),
                            use_item_ref_on_pay: item.ref_on_pay.clone(),
                            bill_item_amt: format!("{:.2}", item.amount),
                            bill_item_eqv_amt: format!("{:.2}", item.eqv_amount),
                            coll_sp: codes.sp_code.clone(),
                        })
                        .collect(),
                },
            },
        },
    };

    sign_and_wrap("billSubReq", &doc, signer)
}

#[derive(Debug, Serialize)]
struct SucSpPmtReq {
    #[serde(rename = "ReqId")]
    req_id: String,
    #[serde(rename = "SpGrpCode")]
    sp_grp_code: String,
    #[serde(rename = "SysCode")]
    sys_code: String,
    #[serde(rename = "TrxDt")]
    trx_dt: String,
    #[serde(rename = "Rsv1")]
    rsv1: String,
    #[serde(rename = "Rsv2")]
    rsv2: String,
    #[serde(rename = "Rsv3")]
    rsv3: String,
}

/// Compose the signed daily reconciliation request for a business date.
pub fn compose_reconciliation_request(
    req_id: &str,
    trx_date: NaiveDate,
    codes: &ProviderCodes,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = SucSpPmtReq {
        req_id: req_id.to_string(),
        sp_grp_code: codes.sp_grp_code.clone(),
        sys_code: codes.sys_code.clone(),
        trx_dt: trx_date.format("%Y-%m-%d").to_string(),
        rsv1: String::new(),
        rsv2: String::new(),
        rsv3: String::new(),
    };

    sign_and_wrap("sucSpPmtReq", &doc, signer)
}

#[derive(Debug, Serialize)]
struct BillCanclReq {
    #[serde(rename = "ReqId")]
    req_id: String,
    #[serde(rename = "SpGrpCode")]
    sp_grp_code: String,
    #[serde(rename = "SysCode")]
    sys_code: String,
    #[serde(rename = "BillTyp")]
    bill_typ: String,
    #[serde(rename = "GrpBillId")]
    grp_bill_id: String,
    #[serde(rename = "CanclGenBy")]
    cancl_gen_by: String,
    #[serde(rename = "CanclApprBy")]
    cancl_appr_by: String,
    #[serde(rename = "CanclReasn")]
    cancl_reasn: String,
}

/// Compose the signed bill cancellation request.
pub fn compose_cancellation_request(
    req_id: &str,
    cancelled: &CancelledBill,
    group_bill_id: &str,
    codes: &ProviderCodes,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = BillCanclReq {
        req_id: req_id.to_string(),
        sp_grp_code: codes.sp_grp_code.clone(),
        sys_code: codes.sys_code.clone(),
        bill_typ: "1".to_string(),
        grp_bill_id: group_bill_id.to_string(),
        cancl_gen_by: cancelled.gen_by.clone().unwrap_or_default(),
        cancl_appr_by: cancelled.appr_by.clone().unwrap_or_default(),
        cancl_reasn: cancelled.reason.clone(),
    };

    sign_and_wrap("billCanclReq", &doc, signer)
}

// ============================================================================
// Outbound acknowledgements (returned synchronously from callbacks)
// ============================================================================

#[derive(Debug, Serialize)]
struct ResponseAck {
    #[serde(rename = "AckId")]
    ack_id: String,
    #[serde(rename = "ResId")]
    res_id: String,
    #[serde(rename = "AckStsCode")]
    ack_sts_code: String,
}

#[derive(Debug, Serialize)]
struct RequestAck {
    #[serde(rename = "AckId")]
    ack_id: String,
    #[serde(rename = "ReqId")]
    req_id: String,
    #[serde(rename = "AckStsCode")]
    ack_sts_code: String,
}

/// Ack for the control-number response callback (`billSubResAck`).
pub fn compose_submission_response_ack(
    ack_id: &str,
    res_id: &str,
    ack_sts_code: &str,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = ResponseAck {
        ack_id: ack_id.to_string(),
        res_id: res_id.to_string(),
        ack_sts_code: ack_sts_code.to_string(),
    };
    sign_and_wrap("billSubResAck", &doc, signer)
}

/// Ack for the payment notification callback (`pmtSpNtfReqAck`).
pub fn compose_payment_notification_ack(
    ack_id: &str,
    req_id: &str,
    ack_sts_code: &str,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = RequestAck {
        ack_id: ack_id.to_string(),
        req_id: req_id.to_string(),
        ack_sts_code: ack_sts_code.to_string(),
    };
    sign_and_wrap("pmtSpNtfReqAck", &doc, signer)
}

/// Ack for the reconciliation response callback (`sucSpPmtResAck`).
pub fn compose_reconciliation_response_ack(
    ack_id: &str,
    res_id: &str,
    ack_sts_code: &str,
    signer: &dyn PayloadSigner,
) -> Result<String, AppError> {
    let doc = ResponseAck {
        ack_id: ack_id.to_string(),
        res_id: res_id.to_string(),
        ack_sts_code: ack_sts_code.to_string(),
    };
    sign_and_wrap("sucSpPmtResAck", &doc, signer)
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// Parsed synchronous acknowledgement to one of our requests.
#[derive(Debug, Clone, Deserialize)]
pub struct Acknowledgement {
    #[serde(rename = "AckId", default)]
    pub ack_id: String,
    #[serde(rename = "ReqId", default)]
    pub req_id: String,
    #[serde(rename = "AckStsCode", default)]
    pub ack_sts_code: String,
    #[serde(rename = "AckStsDesc", default)]
    pub ack_sts_desc: String,
}

impl Acknowledgement {
    pub fn is_success(&self) -> bool {
        self.ack_sts_code == ACK_SUCCESS_CODE
    }
}

#[derive(Debug, Deserialize)]
struct AckEnvelope<T> {
    #[serde(
        rename = "billSubReqAck",
        alias = "sucSpPmtReqAck",
        alias = "billCanclReqAck"
    )]
    body: T,
    #[serde(rename = "signature", default)]
    _signature: Option<String>,
}

/// Parse the acknowledgement returned for any outbound request type.
pub fn parse_request_acknowledgement(xml: &str) -> Result<Acknowledgement, AppError> {
    let envelope: AckEnvelope<Acknowledgement> = from_str(xml).map_err(xml_err)?;
    Ok(envelope.body)
}

/// Final asynchronous response to a control-number request.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlNumberResponse {
    #[serde(rename = "ResId", default)]
    pub res_id: String,
    #[serde(rename = "ReqId", default)]
    pub req_id: String,
    #[serde(rename = "GrpBillId", default)]
    pub grp_bill_id: String,
    #[serde(rename = "CustCntrNum", default)]
    pub cust_cntr_num: String,
    #[serde(rename = "ResStsCode", default)]
    pub res_sts_code: String,
    #[serde(rename = "ResStsDesc", default)]
    pub res_sts_desc: String,
    #[serde(rename = "BillStsCode", default)]
    pub bill_sts_code: String,
    #[serde(rename = "BillStsDesc", default)]
    pub bill_sts_desc: String,
}

#[derive(Debug, Deserialize)]
struct BillSubResEnvelope {
    #[serde(rename = "billSubRes")]
    body: ControlNumberResponse,
    #[serde(rename = "signature", default)]
    _signature: Option<String>,
}

pub fn parse_control_number_response(xml: &str) -> Result<ControlNumberResponse, AppError> {
    let envelope: BillSubResEnvelope = from_str(xml).map_err(xml_err)?;
    Ok(envelope.body)
}

/// Inbound payment notification.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    #[serde(rename = "ReqId", default)]
    pub req_id: String,
    #[serde(rename = "GrpBillId", default)]
    pub grp_bill_id: String,
    #[serde(rename = "CustCntrNum", default)]
    pub cust_cntr_num: String,
    #[serde(rename = "PspCode", default)]
    pub psp_code: String,
    #[serde(rename = "PspName", default)]
    pub psp_name: String,
    #[serde(rename = "TrxId", default)]
    pub trx_id: String,
    #[serde(rename = "PayRefId", default)]
    pub payref_id: String,
    #[serde(rename = "BillAmt", default)]
    pub bill_amt: String,
    #[serde(rename = "PaidAmt", default)]
    pub paid_amt: String,
    #[serde(rename = "Ccy", default)]
    pub ccy: String,
    #[serde(rename = "CollAccNum", default)]
    pub coll_acc_num: String,
    #[serde(rename = "TrxDtTm", default)]
    pub trx_dt_tm: String,
    #[serde(rename = "UsdPayChnl", default)]
    pub usd_pay_chnl: String,
    #[serde(rename = "TrdPtyTrxId", default)]
    pub trdpty_trx_id: String,
    #[serde(rename = "PyrCellNum", default)]
    pub pyr_cell_num: String,
    #[serde(rename = "PyrEmail", default)]
    pub pyr_email: String,
    #[serde(rename = "PyrName", default)]
    pub pyr_name: String,
}

#[derive(Debug, Deserialize)]
struct PmtSpNtfReqEnvelope {
    #[serde(rename = "pmtSpNtfReq")]
    body: PaymentNotification,
    #[serde(rename = "signature", default)]
    _signature: Option<String>,
}

pub fn parse_payment_notification(xml: &str) -> Result<PaymentNotification, AppError> {
    let envelope: PmtSpNtfReqEnvelope = from_str(xml).map_err(xml_err)?;
    Ok(envelope.body)
}

/// One reported settlement record within a reconciliation response.
#[derive(Debug, Clone, Deserialize)]
pub struct PmtTrxDtl {
    #[serde(rename = "CustCntrNum", default)]
    pub cust_cntr_num: String,
    #[serde(rename = "GrpBillId", default)]
    pub grp_bill_id: String,
    #[serde(rename = "SpCode", default)]
    pub sp_code: String,
    #[serde(rename = "BillId", default)]
    pub bill_id: String,
    #[serde(rename = "BillCtrNum", default)]
    pub bill_ctr_num: String,
    #[serde(rename = "PspCode", default)]
    pub psp_code: String,
    #[serde(rename = "PspName", default)]
    pub psp_name: String,
    #[serde(rename = "TrxId", default)]
    pub trx_id: String,
    #[serde(rename = "PayRefId", default)]
    pub payref_id: String,
    #[serde(rename = "BillAmt", default)]
    pub bill_amt: String,
    #[serde(rename = "PaidAmt", default)]
    pub paid_amt: String,
    #[serde(rename = "BillPayOpt", default)]
    pub bill_pay_opt: String,
    #[serde(rename = "Ccy", default)]
    pub ccy: String,
    #[serde(rename = "CollAccNum", default)]
    pub coll_acc_num: String,
    #[serde(rename = "TrxDtTm", default)]
    pub trx_dt_tm: String,
    #[serde(rename = "UsdPayChnl", default)]
    pub usd_pay_chnl: String,
    #[serde(rename = "TrdPtyTrxId", default)]
    pub trdpty_trx_id: String,
    #[serde(rename = "QtRefId", default)]
    pub qt_ref_id: String,
    #[serde(rename = "PyrCellNum", default)]
    pub pyr_cell_num: String,
    #[serde(rename = "PyrEmail", default)]
    pub pyr_email: String,
    #[serde(rename = "PyrName", default)]
    pub pyr_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PmtTrxDtls {
    #[serde(rename = "PmtTrxDtl", default)]
    pub records: Vec<PmtTrxDtl>,
}

/// Asynchronous reconciliation response for a requested business date.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationResponse {
    #[serde(rename = "ResId", default)]
    pub res_id: String,
    #[serde(rename = "ReqId", default)]
    pub req_id: String,
    #[serde(rename = "PayStsCode", default)]
    pub pay_sts_code: String,
    #[serde(rename = "PayStsDesc", default)]
    pub pay_sts_desc: String,
    #[serde(rename = "PmtTrxDtls", default)]
    pub details: PmtTrxDtls,
}

#[derive(Debug, Deserialize)]
struct SucSpPmtResEnvelope {
    #[serde(rename = "sucSpPmtRes")]
    body: ReconciliationResponse,
    #[serde(rename = "signature", default)]
    _signature: Option<String>,
}

pub fn parse_reconciliation_response(xml: &str) -> Result<ReconciliationResponse, AppError> {
    let envelope: SucSpPmtResEnvelope = from_str(xml).map_err(xml_err)?;
    Ok(envelope.body)
}

/// Final asynchronous response to a cancellation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CancellationResponse {
    #[serde(rename = "ResId", default)]
    pub res_id: String,
    #[serde(rename = "ReqId", default)]
    pub req_id: String,
    #[serde(rename = "GrpBillId", default)]
    pub grp_bill_id: String,
    #[serde(rename = "CanclStsCode", default)]
    pub cancl_sts_code: String,
    #[serde(rename = "CanclStsDesc", default)]
    pub cancl_sts_desc: String,
}

#[derive(Debug, Deserialize)]
struct BillCanclResEnvelope {
    #[serde(rename = "billCanclRes")]
    body: CancellationResponse,
    #[serde(rename = "signature", default)]
    _signature: Option<String>,
}

pub fn parse_cancellation_response(xml: &str) -> Result<CancellationResponse, AppError> {
    let envelope: BillCanclResEnvelope = from_str(xml).map_err(xml_err)?;
    Ok(envelope.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::signer::HmacSigner;
    use crate::models::BillingDepartment;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use secrecy::Secret;
    use uuid::Uuid;

    fn signer() -> HmacSigner {
        HmacSigner::new(Secret::new("test-secret".to_string()))
    }

    fn codes() -> ProviderCodes {
        ProviderCodes {
            sp_grp_code: "SP19917".to_string(),
            sp_code: "SP19917".to_string(),
            sub_sp_code: "2001".to_string(),
            sys_code: "NIMRB001".to_string(),
        }
    }

    fn fixture_bill() -> (Bill, Vec<BillItem>, Customer) {
        let now = Utc::now();
        let dept = BillingDepartment {
            dept_id: Uuid::new_v4(),
            name: "HQ".to_string(),
            code: "HQ01".to_string(),
            description: None,
            account_num: "0150211612345".to_string(),
            created_utc: now,
            updated_utc: now,
        };
        let customer = Customer {
            customer_id: Uuid::new_v4(),
            first_name: "Amina".to_string(),
            middle_name: None,
            last_name: "Mushi".to_string(),
            tin: Some("123456789".to_string()),
            id_num: "19900101-00001-00001-01".to_string(),
            id_type: "1".to_string(),
            account_num: None,
            cell_num: Some("255700000001".to_string()),
            email: Some("amina@example.org".to_string()),
            created_utc: now,
            updated_utc: now,
        };
        let mut bill = Bill::new(
            &dept,
            customer.customer_id,
            None,
            Some("Research clearance".to_string()),
            "TZS".to_string(),
            Some("clerk".to_string()),
            Some("manager".to_string()),
            now,
        );
        let items = vec![BillItem::new(
            &bill.bill_id,
            dept.dept_id,
            "Research Fees",
            "140101",
            "Ethics review",
            1,
            Decimal::new(50_000, 0),
            now,
        )];
        bill.apply_item_totals(&items);
        (bill, items, customer)
    }

    #[test]
    fn submission_request_is_signed_envelope() {
        let (bill, items, customer) = fixture_bill();
        let signer = signer();
        let xml = compose_bill_submission_request(
            "req-123",
            &bill,
            &items,
            &customer,
            "HQ01",
            &codes(),
            &signer,
        )
        .unwrap();

        assert!(xml.starts_with("<Gepg><billSubReq>"));
        assert!(xml.contains("<ReqId>req-123</ReqId>"));
        assert!(xml.contains("<BillAmt>50000.00</BillAmt>"));
        assert!(xml.contains("<GfsCode>140101</GfsCode>"));

        let (inner, signature) = split_envelope(&xml).unwrap();
        assert!(inner.starts_with("<billSubReq>"));
        assert!(signer.verify(&inner, &signature.unwrap()).unwrap());
    }

    #[test]
    fn reconciliation_request_carries_date() {
        let xml = compose_reconciliation_request(
            "req-777",
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            &codes(),
            &signer(),
        )
        .unwrap();
        assert!(xml.contains("<TrxDt>2024-03-15</TrxDt>"));
        assert!(xml.contains("<sucSpPmtReq>"));
    }

    #[test]
    fn parse_ack_all_request_types() {
        for root in ["billSubReqAck", "sucSpPmtReqAck", "billCanclReqAck"] {
            let xml = format!(
                "<Gepg><{root}><AckId>A1</AckId><ReqId>R1</ReqId>\
                 <AckStsCode>7101</AckStsCode><AckStsDesc>Received</AckStsDesc></{root}>\
                 <signature>sig</signature></Gepg>"
            );
            let ack = parse_request_acknowledgement(&xml).unwrap();
            assert_eq!(ack.req_id, "R1");
            assert!(ack.is_success());
        }
    }

    #[test]
    fn parse_control_number_response_fields() {
        let xml = "<Gepg><billSubRes><ResId>RS1</ResId><ReqId>RQ1</ReqId>\
                   <GrpBillId>HQ0120240101</GrpBillId><CustCntrNum>123456789012</CustCntrNum>\
                   <ResStsCode>7101</ResStsCode><ResStsDesc>ok</ResStsDesc>\
                   <BillStsCode>7101</BillStsCode><BillStsDesc>ok</BillStsDesc></billSubRes>\
                   <signature>sig</signature></Gepg>";
        let res = parse_control_number_response(xml).unwrap();
        assert_eq!(res.cust_cntr_num, "123456789012");
        assert_eq!(res.grp_bill_id, "HQ0120240101");
    }

    #[test]
    fn parse_reconciliation_response_with_records() {
        let xml = "<Gepg><sucSpPmtRes><ResId>RS9</ResId><ReqId>RQ9</ReqId>\
                   <PayStsCode>7101</PayStsCode><PayStsDesc>ok</PayStsDesc>\
                   <PmtTrxDtls>\
                   <PmtTrxDtl><PayRefId>P1</PayRefId><BillId>B1</BillId>\
                   <PaidAmt>100.00</PaidAmt><Ccy>TZS</Ccy></PmtTrxDtl>\
                   <PmtTrxDtl><PayRefId>P2</PayRefId><BillId>B2</BillId>\
                   <PaidAmt>55.00</PaidAmt><Ccy>USD</Ccy></PmtTrxDtl>\
                   </PmtTrxDtls></sucSpPmtRes><signature>sig</signature></Gepg>";
        let res = parse_reconciliation_response(xml).unwrap();
        assert_eq!(res.details.records.len(), 2);
        assert_eq!(res.details.records[0].payref_id, "P1");
        assert_eq!(res.details.records[1].ccy, "USD");
    }

    #[test]
    fn parse_reconciliation_response_without_records() {
        let xml = "<Gepg><sucSpPmtRes><ResId>RS9</ResId><ReqId>RQ9</ReqId>\
                   <PayStsCode>7101</PayStsCode><PayStsDesc>no data</PayStsDesc>\
                   </sucSpPmtRes><signature>sig</signature></Gepg>";
        let res = parse_reconciliation_response(xml).unwrap();
        assert!(res.details.records.is_empty());
    }

    #[test]
    fn split_envelope_rejects_garbage() {
        assert!(split_envelope("<NotGepg/>").is_err());
        assert!(split_envelope("").is_err());
    }

    #[test]
    fn response_ack_round_trips_through_parser_shapes() {
        let signer = signer();
        let ack = compose_payment_notification_ack("A9", "R9", ACK_SUCCESS_CODE, &signer).unwrap();
        assert!(ack.contains("<pmtSpNtfReqAck>"));
        assert!(ack.contains("<AckStsCode>7101</AckStsCode>"));
        let (inner, signature) = split_envelope(&ack).unwrap();
        assert!(signer.verify(&inner, &signature.unwrap()).unwrap());
    }
}
