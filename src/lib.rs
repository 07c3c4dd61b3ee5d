pub mod auth;
pub mod bookings;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod payments;
pub mod policy;
pub mod refunds;
pub mod store;
pub mod sweep;
pub mod tables;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::Json,
    routing::{get, patch, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use auth::TokenService;
use bookings::BookingService;
use config::{GatewayConfig, PolicyConfig};
use metrics::{EngineMetrics, MetricsSnapshot};
use payments::{GatewayCodec, PaymentSessionManager, ReconciliationProcessor};
use policy::PolicyEngine;
use refunds::{RefundEngine, RefundGateway};
use store::BookingStore;
use tables::TableInventory;

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    paths(
        tables::list_tables_handler,
        tables::set_table_state_handler,
        bookings::quote_handler,
        bookings::create_booking_handler,
        bookings::list_bills_handler,
        bookings::get_bill_handler,
        bookings::confirm_arrival_handler,
        bookings::cancel_bill_handler,
        bookings::remaining_payment_handler,
        bookings::change_tables_handler,
        refunds::refund_eligibility_handler,
        refunds::refund_handler,
        payments::get_payment_handler,
        payments::vnpay_return_handler,
        payments::vnpay_ipn_handler,
        metrics_handler,
    ),
    components(schemas(
        tables::Table,
        tables::TableState,
        tables::SetTableStateRequest,
        policy::CustomerTier,
        policy::PaymentQuote,
        bookings::Bill,
        bookings::BillState,
        bookings::VisitStatus,
        bookings::PaymentStatus,
        bookings::PaymentMethod,
        bookings::CartLine,
        bookings::BillSnapshot,
        bookings::PaymentOption,
        bookings::BookingRequest,
        bookings::QuoteRequest,
        bookings::RemainingMethod,
        bookings::RemainingPaymentRequest,
        bookings::ChangeTablesRequest,
        bookings::BillResponse,
        bookings::BookingOutcome,
        bookings::CancelOutcome,
        payments::PaymentType,
        payments::PaymentState,
        payments::Payment,
        payments::PaymentSession,
        payments::ReconciliationOutcome,
        payments::IpnResponse,
        refunds::RefundStatus,
        refunds::Refund,
        refunds::RefundEligibility,
        refunds::RefundRequest,
        refunds::RefundResponse,
        MetricsSnapshot,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "tables", description = "Table inventory"),
        (name = "bookings", description = "Bookings and the bill lifecycle"),
        (name = "payments", description = "Payment sessions and gateway callbacks"),
        (name = "refunds", description = "Refund eligibility and execution"),
        (name = "engine", description = "Engine health counters")
    ),
    info(
        title = "Table Booking API",
        version = "0.1.0",
        description = "Restaurant table booking with deposits, gateway payments, refunds and automatic bill sweeps"
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
            );
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingService>,
    pub tables: Arc<TableInventory>,
    pub sessions: Arc<PaymentSessionManager>,
    pub reconciliation: Arc<ReconciliationProcessor>,
    pub refunds: Arc<RefundEngine>,
    pub tokens: Arc<TokenService>,
    pub metrics: EngineMetrics,
}

impl AppState {
    /// Wire every engine service onto one store
    pub fn new(
        store: Arc<dyn BookingStore>,
        policy: PolicyConfig,
        gateway: GatewayConfig,
        refund_gateway: Arc<dyn RefundGateway>,
        gateway_timeout: Duration,
        jwt_secret: &str,
        metrics: EngineMetrics,
    ) -> Self {
        let engine = PolicyEngine::new(policy.clone());
        let codec = GatewayCodec::new(gateway);

        let tables = Arc::new(TableInventory::new(store.clone(), engine.clone()));
        let sessions = Arc::new(PaymentSessionManager::new(
            store.clone(),
            codec.clone(),
            policy,
            metrics.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationProcessor::new(store.clone(), codec, metrics.clone()));
        let refunds = Arc::new(RefundEngine::new(
            store.clone(),
            engine.clone(),
            refund_gateway,
            gateway_timeout,
            metrics.clone(),
        ));
        let bookings = Arc::new(BookingService::new(
            store,
            engine,
            tables.clone(),
            sessions.clone(),
            refunds.clone(),
        ));

        Self {
            bookings,
            tables,
            sessions,
            reconciliation,
            refunds,
            tokens: Arc::new(TokenService::new(jwt_secret)),
            metrics,
        }
    }

    /// Default policy, test gateway credentials and a simulated refund gateway
    #[cfg(test)]
    pub(crate) fn in_memory(store: Arc<store::MemoryStore>, jwt_secret: &str) -> Self {
        Self::new(
            store,
            PolicyConfig::default(),
            payments::gateway::test_support::test_config(),
            Arc::new(refunds::SimulatedRefundGateway::default()),
            Duration::from_secs(2),
            jwt_secret,
            EngineMetrics::new(),
        )
    }
}

/// Handler for GET /api/engine/metrics
#[utoipa::path(
    get,
    path = "/api/engine/metrics",
    responses((status = 200, description = "Engine counters since startup", body = MetricsSnapshot)),
    tag = "engine"
)]
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Creates and configures the application router
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/tables", get(tables::list_tables_handler))
        .route("/api/tables/:id/state", patch(tables::set_table_state_handler))
        .route("/api/bookings/quote", post(bookings::quote_handler))
        .route("/api/bookings", post(bookings::create_booking_handler))
        .route("/api/bills", get(bookings::list_bills_handler))
        .route("/api/bills/:id", get(bookings::get_bill_handler))
        .route("/api/bills/:id/arrive", post(bookings::confirm_arrival_handler))
        .route("/api/bills/:id/cancel", post(bookings::cancel_bill_handler))
        .route("/api/bills/:id/remaining-payment", post(bookings::remaining_payment_handler))
        .route("/api/bills/:id/tables", put(bookings::change_tables_handler))
        .route("/api/bills/:id/refund-eligibility", get(refunds::refund_eligibility_handler))
        .route("/api/bills/:id/refund", post(refunds::refund_handler))
        .route("/api/payments/vnpay/return", get(payments::vnpay_return_handler))
        .route("/api/payments/vnpay/ipn", get(payments::vnpay_ipn_handler))
        .route("/api/payments/:order_id", get(payments::get_payment_handler))
        .route("/api/engine/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests;
