mod common;

use billing_service::services::BillingStore;
use common::{
    TestApp, control_number_response_xml, payment_notification_xml, wait_until,
};
use rust_decimal::Decimal;

#[tokio::test]
async fn control_number_callback_assigns_number_and_delivers_invoice_once() {
    let app = TestApp::spawn().await;
    let dept = app.seed_department("NIMR HQ", "HQ01").await;
    let bill = app.seed_bill(&dept, Decimal::new(50_000, 0)).await;

    let xml = control_number_response_xml("REQ-CN-1", &bill.group_bill_id, "123456789012");

    let response = app.post_callback("/callbacks/control-number", &xml).await;
    assert_eq!(response.status(), 200);
    let ack = response.text().await.unwrap();
    assert!(ack.contains("<billSubResAck>"));
    assert!(ack.contains("<AckStsCode>7101</AckStsCode>"));

    let store = app.state.store.clone();
    let bill_id = bill.bill_id.clone();
    wait_until("control number assigned", || {
        let store = store.clone();
        let bill_id = bill_id.clone();
        async move {
            store
                .get_bill(&bill_id)
                .await
                .unwrap()
                .and_then(|b| b.control_number)
                == Some(123456789012)
        }
    })
    .await;

    // Invoice delivery claimed exactly once for this control number.
    assert!(app
        .state
        .store
        .delivery_exists("auto:invoice_cn:123456789012")
        .await
        .unwrap());

    // Re-delivering the identical callback changes nothing.
    let response = app.post_callback("/callbacks/control-number", &xml).await;
    assert_eq!(response.status(), 200);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let bill_after = app
        .state
        .store
        .get_bill(&bill.bill_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bill_after.control_number, Some(123456789012));
}

#[tokio::test]
async fn conflicting_control_number_response_does_not_overwrite() {
    let app = TestApp::spawn().await;
    let dept = app.seed_department("NIMR HQ", "HQ01").await;
    let bill = app.seed_bill(&dept, Decimal::new(50_000, 0)).await;

    let first = control_number_response_xml("REQ-CN-2", &bill.group_bill_id, "111111111111");
    app.post_callback("/callbacks/control-number", &first).await;

    let store = app.state.store.clone();
    let bill_id = bill.bill_id.clone();
    wait_until("first control number assigned", || {
        let store = store.clone();
        let bill_id = bill_id.clone();
        async move {
            store
                .get_bill(&bill_id)
                .await
                .unwrap()
                .and_then(|b| b.control_number)
                .is_some()
        }
    })
    .await;

    // A later response with a different number is a duplicate marker only.
    let second = control_number_response_xml("REQ-CN-2", &bill.group_bill_id, "222222222222");
    app.post_callback("/callbacks/control-number", &second).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let bill_after = app
        .state
        .store
        .get_bill(&bill.bill_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bill_after.control_number, Some(111111111111));
}

#[tokio::test]
async fn duplicate_payment_callback_creates_exactly_one_payment() {
    let app = TestApp::spawn().await;
    let dept = app.seed_department("NIMR HQ", "HQ01").await;
    let bill = app.seed_bill(&dept, Decimal::new(50_000, 0)).await;
    app.state
        .store
        .set_control_number_if_unset(&bill.bill_id, 991234567890)
        .await
        .unwrap();

    let xml = payment_notification_xml(
        "REQ-PAY-1",
        &bill.group_bill_id,
        "991234567890",
        "PAYREF-1",
        "50000.00",
    );

    let response = app.post_callback("/callbacks/payment", &xml).await;
    assert_eq!(response.status(), 200);
    let ack = response.text().await.unwrap();
    assert!(ack.contains("<pmtSpNtfReqAck>"));

    let store = app.state.store.clone();
    let bill_id = bill.bill_id.clone();
    wait_until("payment recorded", || {
        let store = store.clone();
        let bill_id = bill_id.clone();
        async move { store.get_payment_for_bill(&bill_id).await.unwrap().is_some() }
    })
    .await;

    let first_payment = app
        .state
        .store
        .get_payment_for_bill(&bill.bill_id)
        .await
        .unwrap()
        .unwrap();

    // Same settlement delivered again, and once more under a new request id.
    app.post_callback("/callbacks/payment", &xml).await;
    let replay = payment_notification_xml(
        "REQ-PAY-2",
        &bill.group_bill_id,
        "991234567890",
        "PAYREF-1",
        "50000.00",
    );
    app.post_callback("/callbacks/payment", &replay).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let payment_after = app
        .state
        .store
        .get_payment_for_bill(&bill.bill_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.payment_id, first_payment.payment_id);
    assert_eq!(payment_after.cust_cntr_num, 991234567890);

    // Receipt delivery claimed once for the gateway receipt.
    assert!(app
        .state
        .store
        .delivery_exists("auto:receipt_payref:PAYREF-1")
        .await
        .unwrap());
}

#[tokio::test]
async fn callbacks_always_return_a_well_formed_ack() {
    let app = TestApp::spawn().await;

    // Garbage body: still HTTP 200 with an ack envelope.
    let response = app
        .post_callback("/callbacks/payment", "this is not xml")
        .await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("<Gepg>"));

    // Unknown bill: the ack is still a success; the failure lands in the
    // ledger, never on the wire.
    let xml = payment_notification_xml("REQ-PAY-9", "NOSUCHBILL", "1", "PAYREF-9", "10.00");
    let response = app.post_callback("/callbacks/payment", &xml).await;
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("7101"));
}
