// HTTP handlers for payment sessions and gateway callbacks

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use tracing::debug;

use crate::auth::AuthenticatedUser;
use crate::payments::{IpnResponse, Payment, PaymentError, ReconciliationOutcome};
use crate::AppState;

/// Handler for GET /api/payments/:order_id
/// Lets the client poll its session after returning from the gateway
#[utoipa::path(
    get,
    path = "/api/payments/{order_id}",
    params(("order_id" = String, Path, description = "Gateway order reference")),
    responses(
        (status = 200, description = "Payment session", body = Payment),
        (status = 404, description = "No such session for this user")
    ),
    security(("bearer_auth" = [])),
    tag = "payments"
)]
pub async fn get_payment_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<String>,
) -> Result<Json<Payment>, PaymentError> {
    let payment = state.sessions.session_status(&order_id, user.user_id).await?;
    Ok(Json(payment))
}

/// Handler for GET /api/payments/vnpay/return
/// Browser redirect back from the gateway; applies the outcome if the
/// notification has not already done so
#[utoipa::path(
    get,
    path = "/api/payments/vnpay/return",
    responses(
        (status = 200, description = "Callback applied (or already applied)", body = ReconciliationOutcome),
        (status = 400, description = "Signature or amount check failed"),
        (status = 404, description = "Unknown order reference")
    ),
    tag = "payments"
)]
pub async fn vnpay_return_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ReconciliationOutcome>, PaymentError> {
    debug!("Gateway return for {:?}", params.get("vnp_TxnRef"));
    let outcome = state.reconciliation.process(&params, Utc::now()).await?;
    Ok(Json(outcome))
}

/// Handler for GET /api/payments/vnpay/ipn
/// Server-to-server notification; always answers 200 with a gateway result code
#[utoipa::path(
    get,
    path = "/api/payments/vnpay/ipn",
    responses((status = 200, description = "Gateway acknowledgement", body = IpnResponse)),
    tag = "payments"
)]
pub async fn vnpay_ipn_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<IpnResponse> {
    debug!("Gateway notification for {:?}", params.get("vnp_TxnRef"));
    Json(state.reconciliation.handle_ipn(&params, Utc::now()).await)
}
