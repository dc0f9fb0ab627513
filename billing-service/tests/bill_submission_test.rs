mod common;

use billing_service::models::{LogStatus, RequestType};
use billing_service::services::BillingStore;
use common::{TestApp, wait_until};
use serde_json::json;

fn bill_payload() -> serde_json::Value {
    json!({
        "dept": "NIMR HQ",
        "description": "Research clearance fees",
        "currency": "TZS",
        "customer": {
            "first_name": "Amina",
            "last_name": "Mushi",
            "cell_num": "255700000001",
            "email": "amina@example.org"
        },
        "items": [
            {
                "source_name": "Research Fees",
                "gfs_code": "140101",
                "description": "Ethics review",
                "qty": 1,
                "unit_amount": "50000.00"
            }
        ]
    })
}

#[tokio::test]
async fn submitting_a_bill_requests_a_control_number() {
    let app = TestApp::spawn().await;
    app.mock_gateway_ok().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    let response = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&bill_payload())
        .send()
        .await
        .expect("Failed to submit bill");

    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.expect("Invalid response body");
    let req_id = body["req_id"].as_str().expect("missing req_id").to_string();
    let bill_id = body["bill_id"].as_str().expect("missing bill_id").to_string();
    assert!(bill_id.starts_with("HQ01"));

    let bill = app
        .state
        .store
        .get_bill(&bill_id)
        .await
        .unwrap()
        .expect("bill not persisted");
    assert_eq!(bill.amount.to_string(), "50000.00");

    // The outbound request lands in the ledger and is acknowledged.
    let store = app.state.store.clone();
    let req = req_id.clone();
    wait_until("control number request acknowledged", || {
        let store = store.clone();
        let req = req.clone();
        async move {
            store
                .get_log(&req, RequestType::ControlNumberRequest)
                .await
                .unwrap()
                .map(|log| log.status == LogStatus::Pending.as_str() && log.req_ack.is_some())
                .unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test]
async fn identical_submission_replays_the_same_pair() {
    let app = TestApp::spawn().await;
    app.mock_gateway_ok().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    let payload = bill_payload();

    let first = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first: serde_json::Value = first.json().await.unwrap();

    let second = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second: serde_json::Value = second.json().await.unwrap();

    assert_eq!(first["req_id"], second["req_id"]);
    assert_eq!(first["bill_id"], second["bill_id"]);
}

#[tokio::test]
async fn submission_without_items_is_rejected() {
    let app = TestApp::spawn().await;
    app.seed_department("NIMR HQ", "HQ01").await;

    let mut payload = bill_payload();
    payload["items"] = json!([]);

    let response = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&payload)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn submission_for_unknown_department_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/api/bills", app.address))
        .json(&bill_payload())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}
