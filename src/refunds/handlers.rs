// HTTP handlers for refund endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::refunds::{RefundEligibility, RefundRequest, RefundResponse};
use crate::AppState;

/// Handler for GET /api/bills/:id/refund-eligibility
#[utoipa::path(
    get,
    path = "/api/bills/{id}/refund-eligibility",
    params(("id" = Uuid, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Eligibility with reasons and maximum amount", body = RefundEligibility),
        (status = 404, description = "Bill not found")
    ),
    security(("bearer_auth" = [])),
    tag = "refunds"
)]
pub async fn refund_eligibility_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<RefundEligibility>, ApiError> {
    let eligibility = state.refunds.eligibility(user.user_id, bill_id, Utc::now()).await?;
    Ok(Json(eligibility))
}

/// Handler for POST /api/bills/:id/refund
/// Refunds an online payment and cancels the bill
#[utoipa::path(
    post,
    path = "/api/bills/{id}/refund",
    params(("id" = Uuid, Path, description = "Bill ID")),
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund completed, bill cancelled", body = RefundResponse),
        (status = 409, description = "Bill already refunded"),
        (status = 422, description = "Bill not eligible"),
        (status = 503, description = "Refund gateway unavailable, safe to retry")
    ),
    security(("bearer_auth" = [])),
    tag = "refunds"
)]
pub async fn refund_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<RefundResponse>, ApiError> {
    request.validate()?;

    let completed = state
        .refunds
        .execute(user.user_id, bill_id, request.amount, &request.reason, Utc::now())
        .await?;

    Ok(Json(RefundResponse {
        refund: completed.refund,
        bill: completed.bill,
    }))
}
