#![allow(dead_code)]

use billing_service::config::{
    Config, DatabaseBackend, DatabaseConfig, DeliveryConfig, GepgConfig, OperatorConfig,
    ReconciliationConfig, ServerConfig, WorkerConfig,
};
use billing_service::models::{Bill, BillItem, BillingDepartment, Customer, SystemInfo};
use billing_service::services::BillingStore;
use billing_service::{AppState, Application};
use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::Secret;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACK_OK: &str = "<Gepg><billSubReqAck><AckId>ACK-1</AckId><ReqId>R-1</ReqId>\
<AckStsCode>7101</AckStsCode><AckStsDesc>Request received</AckStsDesc></billSubReqAck>\
<signature>sig</signature></Gepg>";

pub const ACK_REJECTED: &str = "<Gepg><billSubReqAck><AckId>ACK-1</AckId><ReqId>R-1</ReqId>\
<AckStsCode>7105</AckStsCode><AckStsDesc>Invalid service provider</AckStsDesc></billSubReqAck>\
<signature>sig</signature></Gepg>";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub state: AppState,
    pub gateway: MockServer,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let gateway = MockServer::start().await;

        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Random port
            },
            database: DatabaseConfig {
                backend: DatabaseBackend::Memory,
                url: Secret::new("unused".to_string()),
                max_connections: 1,
                min_connections: 1,
            },
            gepg: GepgConfig {
                submission_url: format!("{}/api/bill/sigqrequest", gateway.uri()),
                reconciliation_url: format!("{}/api/sigqrequest/sp_pay", gateway.uri()),
                cancellation_url: format!("{}/api/sigcancel", gateway.uri()),
                com: "default.sp.in".to_string(),
                code: "SP19917".to_string(),
                alg: "00S2".to_string(),
                sp_grp_code: "SP19917".to_string(),
                sp_code: "SP19917".to_string(),
                sub_sp_code: "2001".to_string(),
                sys_code: "TESTB001".to_string(),
                signing_secret: Secret::new("test-secret".to_string()),
                require_valid_signature: false,
                request_timeout_secs: 5,
                max_retries: 2,
                retry_base_delay_ms: 10,
            },
            worker: WorkerConfig {
                enabled: true,
                worker_count: 2,
                queue_size: 64,
            },
            reconciliation: ReconciliationConfig {
                // Tests trigger reconciliation explicitly.
                trigger_enabled: false,
                backfill_days: 7,
                trigger_interval_secs: 3600,
            },
            delivery: DeliveryConfig {
                enabled: false,
                smtp_host: "localhost".to_string(),
                smtp_port: 587,
                smtp_user: String::new(),
                smtp_password: Secret::new(String::new()),
                from_email: "billing@test.local".to_string(),
            },
            operator: OperatorConfig {
                enabled: false,
                smtp_host: "localhost".to_string(),
                smtp_port: 587,
                smtp_user: String::new(),
                smtp_password: Secret::new(String::new()),
                from_email: "billing@test.local".to_string(),
                operator_email: "ops@test.local".to_string(),
            },
            public_url: "http://localhost:0".to_string(),
            service_name: "billing-service-test".to_string(),
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let state = app.state();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the HTTP server to come up.
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            state,
            gateway,
            client,
        }
    }

    /// Accept every gateway request with a success-continue acknowledgement.
    pub async fn mock_gateway_ok(&self) {
        Mock::given(method("POST"))
            .and(path("/api/bill/sigqrequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ACK_OK))
            .mount(&self.gateway)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/sigqrequest/sp_pay"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ACK_OK))
            .mount(&self.gateway)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/sigcancel"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ACK_OK))
            .mount(&self.gateway)
            .await;
    }

    pub async fn seed_department(&self, name: &str, code: &str) -> BillingDepartment {
        let now = Utc::now();
        let dept = BillingDepartment {
            dept_id: Uuid::new_v4(),
            name: name.to_string(),
            code: code.to_string(),
            description: None,
            account_num: "0150211612345".to_string(),
            created_utc: now,
            updated_utc: now,
        };
        self.state
            .store
            .insert_department(dept.clone())
            .await
            .expect("Failed to seed department");
        dept
    }

    pub async fn seed_system_info(&self, code: &str, callback_base: &str) -> SystemInfo {
        let now = Utc::now();
        let info = SystemInfo {
            system_id: Uuid::new_v4(),
            code: code.to_string(),
            name: format!("System {}", code),
            cntrnum_response_callback: format!("{}/cn-callback", callback_base),
            pay_notification_callback: format!("{}/pay-callback", callback_base),
            is_active: true,
            created_utc: now,
            updated_utc: now,
        };
        self.state
            .store
            .insert_system_info(info.clone())
            .await
            .expect("Failed to seed system info");
        info
    }

    /// Seed a bill (with one line item and its customer) directly in the store.
    pub async fn seed_bill(&self, dept: &BillingDepartment, amount: Decimal) -> Bill {
        let now = Utc::now();
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
            email: Some(format!("cust-{}@example.org", Uuid::new_v4())),
            created_utc: now,
            updated_utc: now,
        };
        let customer = self
            .state
            .store
            .upsert_customer_by_email(customer)
            .await
            .expect("Failed to seed customer");

        let mut bill = Bill::new(
            dept,
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
            amount,
            now,
        )];
        bill.apply_item_totals(&items);

        self.state
            .store
            .insert_bill(bill.clone(), items)
            .await
            .expect("Failed to seed bill");
        bill
    }

    pub async fn post_callback(&self, endpoint: &str, xml: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, endpoint))
            .header("content-type", "application/xml")
            .body(xml.to_string())
            .send()
            .await
            .expect("Failed to post callback")
    }
}

/// Poll an async condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for: {}", description);
}

pub fn control_number_response_xml(req_id: &str, grp_bill_id: &str, cn: &str) -> String {
    format!(
        "<Gepg><billSubRes><ResId>RES-{req_id}</ResId><ReqId>{req_id}</ReqId>\
         <GrpBillId>{grp_bill_id}</GrpBillId><CustCntrNum>{cn}</CustCntrNum>\
         <ResStsCode>7101</ResStsCode><ResStsDesc>Successful</ResStsDesc>\
         <BillStsCode>7101</BillStsCode><BillStsDesc>Bill issued</BillStsDesc></billSubRes>\
         <signature>sig</signature></Gepg>"
    )
}

pub fn payment_notification_xml(
    req_id: &str,
    grp_bill_id: &str,
    cn: &str,
    payref_id: &str,
    amount: &str,
) -> String {
    format!(
        "<Gepg><pmtSpNtfReq><ReqId>{req_id}</ReqId><GrpBillId>{grp_bill_id}</GrpBillId>\
         <CustCntrNum>{cn}</CustCntrNum><PspCode>PSP001</PspCode><PspName>Test Bank</PspName>\
         <TrxId>TRX-{payref_id}</TrxId><PayRefId>{payref_id}</PayRefId>\
         <BillAmt>{amount}</BillAmt><PaidAmt>{amount}</PaidAmt><Ccy>TZS</Ccy>\
         <CollAccNum>0150211612345</CollAccNum><TrxDtTm>2024-03-15T10:30:00</TrxDtTm>\
         <UsdPayChnl>MOBILE</UsdPayChnl><TrdPtyTrxId>TP-{payref_id}</TrdPtyTrxId>\
         <PyrCellNum>255700000001</PyrCellNum><PyrEmail>payer@example.org</PyrEmail>\
         <PyrName>Amina Mushi</PyrName></pmtSpNtfReq><signature>sig</signature></Gepg>"
    )
}

/// Records: `(payref_id, bill_id, control_number, paid_amount, currency)`.
pub fn reconciliation_response_xml(
    req_id: &str,
    records: &[(&str, &str, &str, &str, &str)],
) -> String {
    let mut details = String::new();
    for (payref_id, bill_id, cn, amt, ccy) in records {
        details.push_str(&format!(
            "<PmtTrxDtl><CustCntrNum>{cn}</CustCntrNum><GrpBillId>{bill_id}</GrpBillId>\
             <SpCode>SP19917</SpCode><BillId>{bill_id}</BillId><BillCtrNum>{cn}</BillCtrNum>\
             <PspCode>PSP001</PspCode><PspName>Test Bank</PspName><TrxId>TRX-{payref_id}</TrxId>\
             <PayRefId>{payref_id}</PayRefId><BillAmt>{amt}</BillAmt><PaidAmt>{amt}</PaidAmt>\
             <BillPayOpt>3</BillPayOpt><Ccy>{ccy}</Ccy><CollAccNum>0150211612345</CollAccNum>\
             <TrxDtTm>2024-03-15T10:30:00</TrxDtTm><UsdPayChnl>MOBILE</UsdPayChnl>\
             <TrdPtyTrxId>TP-{payref_id}</TrdPtyTrxId><QtRefId></QtRefId>\
             <PyrCellNum>255700000001</PyrCellNum><PyrEmail></PyrEmail>\
             <PyrName>Amina Mushi</PyrName></PmtTrxDtl>"
        ));
    }
    format!(
        "<Gepg><sucSpPmtRes><ResId>RES-{req_id}</ResId><ReqId>{req_id}</ReqId>\
         <PayStsCode>7101</PayStsCode><PayStsDesc>Successful</PayStsDesc>\
         <PmtTrxDtls>{details}</PmtTrxDtls></sucSpPmtRes><signature>sig</signature></Gepg>"
    )
}
