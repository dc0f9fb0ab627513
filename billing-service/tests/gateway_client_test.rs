mod common;

use billing_service::models::{LogStatus, RequestType};
use billing_service::services::BillingStore;
use common::{ACK_REJECTED, TestApp, control_number_response_xml, wait_until};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bill_payload(email: &str) -> serde_json::Value {
    json!({
        "dept": "NIMR HQ",
        "description": "Research clearance fees",
        "customer": {
            "first_name": "Amina",
            "last_name": "Mushi",
            "email": email
        },
        "items": [
            {
                "source_name": "Research Fees",
                "gfs_code": "140101",
                "description": "Ethics review",
                "unit_amount": "50000.00"
            }
        ]
    })
}

async fn submit(app: &TestApp, email: &str) -> (String, String) {
    let response = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&bill_payload(email))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    (
        body["req_id"].as_str().unwrap().to_string(),
        body["bill_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn transport_failures_are_retried_then_marked_error() {
    let app = TestApp::spawn().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    // Gateway down: every attempt fails with a 503.
    Mock::given(method("POST"))
        .and(path("/api/bill/sigqrequest"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&app.gateway)
        .await;

    let (req_id, _) = submit(&app, "retry@example.org").await;

    let store = app.state.store.clone();
    let req = req_id.clone();
    wait_until("ledger row marked ERROR after retries", || {
        let store = store.clone();
        let req = req.clone();
        async move {
            store
                .get_log(&req, RequestType::ControlNumberRequest)
                .await
                .unwrap()
                .map(|log| log.status == LogStatus::Error.as_str())
                .unwrap_or(false)
        }
    })
    .await;

    // More than one attempt hit the wire.
    let requests = app
        .gateway
        .received_requests()
        .await
        .expect("request recording enabled");
    assert!(requests.len() >= 2, "expected retries, saw {}", requests.len());
}

#[tokio::test]
async fn protocol_rejection_is_terminal_without_retry() {
    let app = TestApp::spawn().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    Mock::given(method("POST"))
        .and(path("/api/bill/sigqrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ACK_REJECTED))
        .mount(&app.gateway)
        .await;

    let (req_id, _) = submit(&app, "rejected@example.org").await;

    let store = app.state.store.clone();
    let req = req_id.clone();
    wait_until("ledger row marked ERROR on rejection", || {
        let store = store.clone();
        let req = req.clone();
        async move {
            store
                .get_log(&req, RequestType::ControlNumberRequest)
                .await
                .unwrap()
                .map(|log| {
                    log.status == LogStatus::Error.as_str() && log.status_desc.contains("7105")
                })
                .unwrap_or(false)
        }
    })
    .await;

    let requests = app.gateway.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "protocol errors must not be retried");
}

#[tokio::test]
async fn gateway_request_carries_protocol_headers_and_signature() {
    let app = TestApp::spawn().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    // The mock only answers when the protocol headers are present.
    Mock::given(method("POST"))
        .and(path("/api/bill/sigqrequest"))
        .and(wiremock::matchers::header("Gepg-Com", "default.sp.in"))
        .and(wiremock::matchers::header("Gepg-Code", "SP19917"))
        .and(wiremock::matchers::header("Gepg-Alg", "00S2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(common::ACK_OK))
        .mount(&app.gateway)
        .await;

    let (req_id, _) = submit(&app, "headers@example.org").await;

    let store = app.state.store.clone();
    let req = req_id.clone();
    wait_until("request acknowledged", || {
        let store = store.clone();
        let req = req.clone();
        async move {
            store
                .get_log(&req, RequestType::ControlNumberRequest)
                .await
                .unwrap()
                .map(|log| log.status == LogStatus::Pending.as_str())
                .unwrap_or(false)
        }
    })
    .await;

    let requests = app.gateway.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.starts_with("<Gepg><billSubReq>"));
    assert!(body.contains("<signature>"));
    assert!(body.contains("<SpGrpCode>SP19917</SpGrpCode>"));
}

#[tokio::test]
async fn issued_control_number_forwards_to_the_origin_system() {
    let app = TestApp::spawn().await;
    app.mock_gateway_ok().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    // Origin system with its own callback receiver.
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cn-callback"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;
    app.seed_system_info("EXT01", &origin.uri()).await;

    let mut payload = bill_payload("origin@example.org");
    payload["sys_code"] = json!("EXT01");
    let response = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    let bill_id = body["bill_id"].as_str().unwrap().to_string();
    let req_id = body["req_id"].as_str().unwrap().to_string();

    // Gateway responds asynchronously with the control number.
    let xml = control_number_response_xml(&req_id, &bill_id, "777000111222");
    app.post_callback("/callbacks/control-number", &xml).await;

    let store = app.state.store.clone();
    let bill = bill_id.clone();
    wait_until("control number assigned", || {
        let store = store.clone();
        let bill = bill.clone();
        async move {
            store
                .get_bill(&bill)
                .await
                .unwrap()
                .and_then(|b| b.control_number)
                .is_some()
        }
    })
    .await;

    let mut forwarded_seen = false;
    for _ in 0..200 {
        if !origin.received_requests().await.unwrap().is_empty() {
            forwarded_seen = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(forwarded_seen, "origin system was not notified");

    let forwarded = origin.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&forwarded[0].body).unwrap();
    assert_eq!(body["bill_id"], bill_id);
    assert_eq!(body["cntr_num"], 777000111222i64);
    assert!(body["bill_print_url"].as_str().unwrap().contains(&bill_id));
}
