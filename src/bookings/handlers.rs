// HTTP handlers for bookings and bills

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::bookings::{
    BillResponse, BookingError, BookingOutcome, BookingRequest, CancelOutcome, ChangeTablesRequest, Customer,
    QuoteRequest, RemainingPaymentRequest,
};
use crate::policy::PaymentQuote;
use crate::AppState;

/// Address forwarded by the proxy, sent to the gateway as the payer's IP
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn customer(user: &AuthenticatedUser, headers: &HeaderMap) -> Customer {
    Customer {
        user_id: user.user_id,
        tier: user.tier,
        client_ip: client_ip(headers),
    }
}

/// Handler for POST /api/bookings/quote
#[utoipa::path(
    post,
    path = "/api/bookings/quote",
    request_body = QuoteRequest,
    responses((status = 200, description = "Advance payment requirement", body = PaymentQuote)),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn quote_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<QuoteRequest>,
) -> Json<PaymentQuote> {
    Json(state.bookings.quote(user.tier, request.time, request.subtotal, Utc::now()))
}

/// Handler for POST /api/bookings
/// Books directly (201) or opens a payment session (202) depending on policy
#[utoipa::path(
    post,
    path = "/api/bookings",
    request_body = BookingRequest,
    responses(
        (status = 201, description = "Bill created", body = BookingOutcome),
        (status = 202, description = "Payment session opened", body = BookingOutcome),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Table already taken"),
        (status = 422, description = "Payment option not allowed for this booking")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn create_booking_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<BookingOutcome>), BookingError> {
    let outcome = state
        .bookings
        .book(&customer(&user, &headers), request, Utc::now())
        .await?;

    let status = match outcome {
        BookingOutcome::Confirmed { .. } => StatusCode::CREATED,
        BookingOutcome::PaymentRequired { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// Handler for GET /api/bills
#[utoipa::path(
    get,
    path = "/api/bills",
    responses((status = 200, description = "Caller's bills, newest first", body = Vec<BillResponse>)),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn list_bills_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<BillResponse>>, BookingError> {
    Ok(Json(state.bookings.list_bills(user.user_id, Utc::now()).await?))
}

/// Handler for GET /api/bills/:id
#[utoipa::path(
    get,
    path = "/api/bills/{id}",
    params(("id" = Uuid, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Bill", body = BillResponse),
        (status = 404, description = "Bill not found")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn get_bill_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<BillResponse>, BookingError> {
    Ok(Json(state.bookings.get_bill(user.user_id, bill_id, Utc::now()).await?))
}

/// Handler for POST /api/bills/:id/arrive
#[utoipa::path(
    post,
    path = "/api/bills/{id}/arrive",
    params(("id" = Uuid, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Arrival confirmed, tables occupied", body = BillResponse),
        (status = 409, description = "Bill not awaiting arrival"),
        (status = 422, description = "Outside the check-in window")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn confirm_arrival_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<BillResponse>, BookingError> {
    Ok(Json(state.bookings.confirm_arrival(user.user_id, bill_id, Utc::now()).await?))
}

/// Handler for POST /api/bills/:id/cancel
#[utoipa::path(
    post,
    path = "/api/bills/{id}/cancel",
    params(("id" = Uuid, Path, description = "Bill ID")),
    responses(
        (status = 200, description = "Bill cancelled, with the refund if one was due", body = CancelOutcome),
        (status = 422, description = "Too close to the appointment"),
        (status = 503, description = "Refund gateway unavailable, bill unchanged")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn cancel_bill_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, BookingError> {
    Ok(Json(state.bookings.cancel(user.user_id, bill_id, Utc::now()).await?))
}

/// Handler for POST /api/bills/:id/remaining-payment
#[utoipa::path(
    post,
    path = "/api/bills/{id}/remaining-payment",
    params(("id" = Uuid, Path, description = "Bill ID")),
    request_body = RemainingPaymentRequest,
    responses(
        (status = 200, description = "Session opened or remainder deferred to the counter", body = BookingOutcome),
        (status = 409, description = "A payment for this bill is already in progress"),
        (status = 422, description = "No remaining balance")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn remaining_payment_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Path(bill_id): Path<Uuid>,
    Json(request): Json<RemainingPaymentRequest>,
) -> Result<Json<BookingOutcome>, BookingError> {
    let outcome = state
        .bookings
        .remaining_payment(&customer(&user, &headers), bill_id, request.method, Utc::now())
        .await?;
    Ok(Json(outcome))
}

/// Handler for PUT /api/bills/:id/tables
#[utoipa::path(
    put,
    path = "/api/bills/{id}/tables",
    params(("id" = Uuid, Path, description = "Bill ID")),
    request_body = ChangeTablesRequest,
    responses(
        (status = 200, description = "Booking moved", body = BillResponse),
        (status = 409, description = "A requested table is taken"),
        (status = 500, description = "New tables held but old ones not released; retry")
    ),
    security(("bearer_auth" = [])),
    tag = "bookings"
)]
pub async fn change_tables_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(bill_id): Path<Uuid>,
    Json(request): Json<ChangeTablesRequest>,
) -> Result<Json<BillResponse>, BookingError> {
    request.validate()?;
    let bill = state
        .bookings
        .change_tables(user.user_id, bill_id, &request.table_ids, Utc::now())
        .await?;
    Ok(Json(bill))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "127.0.0.1");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }
}
