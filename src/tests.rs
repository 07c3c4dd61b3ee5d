// HTTP tests for the booking API
// The router runs against the in-memory store; tokens are issued with the test secret

use super::*;
use crate::payments::gateway::test_support::signed_callback;
use crate::policy::CustomerTier;
use crate::store::MemoryStore;
use axum::http::{header, HeaderValue, StatusCode};
use axum_test::TestServer;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

const SECRET: &str = "test_secret_key_for_testing_purposes";

// ============================================================================
// Test Helpers
// ============================================================================

fn create_test_app() -> (TestServer, AppState) {
    let state = AppState::in_memory(Arc::new(MemoryStore::new()), SECRET);
    let server = TestServer::new(create_router(state.clone(), Duration::from_secs(5))).unwrap();
    (server, state)
}

fn bearer(state: &AppState, user_id: i32, tier: CustomerTier) -> HeaderValue {
    let token = state
        .tokens
        .issue_access_token(user_id, "guest@example.com", tier)
        .unwrap();
    HeaderValue::from_str(&format!("Bearer {}", token)).unwrap()
}

fn booking_payload(hours_ahead: i64, tables: &[i32], option: &str) -> Value {
    json!({
        "name": "Nguyen Van A",
        "phone": "0901234567",
        "time": (Utc::now() + ChronoDuration::hours(hours_ahead)).to_rfc3339(),
        "num_people": 4,
        "table_ids": tables,
        "payment_option": option,
    })
}

// ============================================================================
// Tables
// ============================================================================

#[tokio::test]
async fn test_list_tables_filters_by_floor() {
    let (server, _) = create_test_app();

    let response = server.get("/api/tables").add_query_param("floor", 2).await;

    response.assert_status_ok();
    let tables: Vec<Value> = response.json();
    assert_eq!(tables.len(), 6);
    assert!(tables.iter().all(|t| t["floor"] == 2 && t["state"] == "empty"));
}

#[tokio::test]
async fn test_set_table_state_with_stale_expectation_conflicts() {
    let (server, state) = create_test_app();
    let auth = bearer(&state, 1, CustomerTier::Regular);

    server
        .patch("/api/tables/3/state")
        .add_header(header::AUTHORIZATION, auth.clone())
        .json(&json!({ "expected": "empty", "state": "reserved" }))
        .await
        .assert_status_ok();

    let response = server
        .patch("/api/tables/3/state")
        .add_header(header::AUTHORIZATION, auth)
        .json(&json!({ "expected": "empty", "state": "occupied" }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["details"]["category"], "conflict");
}

// ============================================================================
// Bookings
// ============================================================================

#[tokio::test]
async fn test_protected_routes_require_token() {
    let (server, _) = create_test_app();

    let response = server.get("/api/bills").await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error_code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_quote_close_booking_requires_payment() {
    let (server, state) = create_test_app();

    let response = server
        .post("/api/bookings/quote")
        .add_header(header::AUTHORIZATION, bearer(&state, 1, CustomerTier::Regular))
        .json(&json!({
            "time": (Utc::now() + ChronoDuration::hours(3)).to_rfc3339(),
            "subtotal": "1000000",
        }))
        .await;

    response.assert_status_ok();
    let quote: Value = response.json();
    assert_eq!(quote["payment_required"], true);
    assert_eq!(quote["full_payment_available"], true);
}

#[tokio::test]
async fn test_counter_booking_far_ahead_is_confirmed() {
    let (server, state) = create_test_app();
    let auth = bearer(&state, 9, CustomerTier::Regular);

    let response = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, auth.clone())
        .json(&booking_payload(48, &[1], "counter"))
        .await;

    response.assert_status(StatusCode::CREATED);
    let outcome: Value = response.json();
    assert_eq!(outcome["status"], "confirmed");
    assert_eq!(outcome["bill"]["payment_status"], "counter_payment");
    assert_eq!(outcome["bill"]["table_ids"], json!([1]));

    let bills: Vec<Value> = server
        .get("/api/bills")
        .add_header(header::AUTHORIZATION, auth)
        .await
        .json();
    assert_eq!(bills.len(), 1);

    let tables: Vec<Value> = server.get("/api/tables").add_query_param("state", "reserved").await.json();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0]["id"], 1);
}

#[tokio::test]
async fn test_counter_booking_inside_payment_window_is_refused() {
    let (server, state) = create_test_app();

    let response = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, bearer(&state, 9, CustomerTier::Regular))
        .json(&booking_payload(3, &[1], "counter"))
        .await;

    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_taken_table_conflicts() {
    let (server, state) = create_test_app();

    server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, bearer(&state, 1, CustomerTier::Vip))
        .json(&booking_payload(5, &[4], "counter"))
        .await
        .assert_status(StatusCode::CREATED);

    let response = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, bearer(&state, 2, CustomerTier::Vip))
        .json(&booking_payload(6, &[4], "counter"))
        .await;
    response.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_bill_of_another_user_is_not_found() {
    let (server, state) = create_test_app();

    let outcome: Value = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, bearer(&state, 1, CustomerTier::Vip))
        .json(&booking_payload(5, &[2], "counter"))
        .await
        .json();
    let bill_id = outcome["bill"]["id"].as_str().unwrap().to_string();

    server
        .get(&format!("/api/bills/{}", bill_id))
        .add_header(header::AUTHORIZATION, bearer(&state, 2, CustomerTier::Regular))
        .await
        .assert_status_not_found();
}

// ============================================================================
// Payments
// ============================================================================

#[tokio::test]
async fn test_deposit_booking_materializes_on_ipn() {
    let (server, state) = create_test_app();
    let auth = bearer(&state, 5, CustomerTier::Regular);

    let response = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, auth.clone())
        .json(&booking_payload(3, &[7], "deposit"))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let outcome: Value = response.json();
    assert_eq!(outcome["status"], "payment_required");
    let order_id = outcome["session"]["order_id"].as_str().unwrap().to_string();
    assert!(outcome["session"]["redirect_url"].as_str().unwrap().contains("vnp_SecureHash="));

    // No bill until the gateway confirms
    let bills: Vec<Value> = server.get("/api/bills").add_header(header::AUTHORIZATION, auth.clone()).await.json();
    assert!(bills.is_empty());

    // Table-hold deposit of 100 000 VND, sent in minor units
    let params = signed_callback(&order_id, 10_000_000, "00", "00");
    let ipn: Value = server.get("/api/payments/vnpay/ipn").add_query_params(&params).await.json();
    assert_eq!(ipn["RspCode"], "00");

    let bills: Vec<Value> = server.get("/api/bills").add_header(header::AUTHORIZATION, auth.clone()).await.json();
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0]["payment_status"], "deposit_paid");

    // Replay is acknowledged without a second bill
    let replay: Value = server.get("/api/payments/vnpay/ipn").add_query_params(&params).await.json();
    assert_eq!(replay["RspCode"], "02");

    let payment: Value = server
        .get(&format!("/api/payments/{}", order_id))
        .add_header(header::AUTHORIZATION, auth)
        .await
        .json();
    assert_eq!(payment["status"], "completed");

    let metrics: Value = server.get("/api/engine/metrics").await.json();
    assert_eq!(metrics["sessions_created"], 1);
    assert_eq!(metrics["duplicate_callbacks"], 1);
}

#[tokio::test]
async fn test_tampered_ipn_is_rejected() {
    let (server, state) = create_test_app();

    let outcome: Value = server
        .post("/api/bookings")
        .add_header(header::AUTHORIZATION, bearer(&state, 5, CustomerTier::Regular))
        .json(&booking_payload(3, &[8], "deposit"))
        .await
        .json();
    let order_id = outcome["session"]["order_id"].as_str().unwrap().to_string();

    let mut params = signed_callback(&order_id, 10_000_000, "00", "00");
    params.insert("vnp_Amount".to_string(), "100".to_string());

    let ipn: Value = server.get("/api/payments/vnpay/ipn").add_query_params(&params).await.json();
    assert_eq!(ipn["RspCode"], "97");

    let response = server.get("/api/payments/vnpay/return").add_query_params(&params).await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["details"]["manual_review"], true);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let (server, _) = create_test_app();

    let doc: Value = server.get("/api-docs/openapi.json").await.json();
    assert!(doc["paths"]["/api/bookings"].is_object());
    assert!(doc["components"]["securitySchemes"]["bearer_auth"].is_object());
}
