use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bookings::{BillSnapshot, PaymentMethod};
use crate::config::PolicyConfig;
use crate::metrics::EngineMetrics;
use crate::payments::error::PaymentError;
use crate::payments::gateway::{GatewayCodec, PaymentUrlRequest};
use crate::payments::{NewPayment, Payment, PaymentSession, PaymentState, PaymentType};
use crate::store::{BookingStore, StoreError};

/// Order ids are retried this many times on a collision
const MAX_ORDER_ID_ATTEMPTS: usize = 3;

/// What a new session pays for
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: i32,
    /// Set for a remaining-balance payment on an existing bill
    pub bill_id: Option<Uuid>,
    /// Set for a new reservation; becomes the bill once paid
    pub snapshot: Option<BillSnapshot>,
    pub amount: Decimal,
    pub payment_type: PaymentType,
    pub order_info: String,
    pub client_ip: String,
}

/// Timestamp in the gateway's clock plus a random suffix
pub fn generate_order_id(codec: &GatewayCodec, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{:06}", codec.format_timestamp(now), suffix)
}

pub struct PaymentSessionManager {
    store: Arc<dyn BookingStore>,
    codec: GatewayCodec,
    policy: PolicyConfig,
    metrics: EngineMetrics,
}

impl PaymentSessionManager {
    pub fn new(store: Arc<dyn BookingStore>, codec: GatewayCodec, policy: PolicyConfig, metrics: EngineMetrics) -> Self {
        Self {
            store,
            codec,
            policy,
            metrics,
        }
    }

    pub fn codec(&self) -> &GatewayCodec {
        &self.codec
    }

    /// Persist a pending payment and return the signed redirect for it.
    ///
    /// The row exists before the URL is handed out, so a callback that beats
    /// the browser back always finds its session. If the URL cannot be built
    /// the row is removed again.
    pub async fn create_session(&self, request: SessionRequest, now: DateTime<Utc>) -> Result<PaymentSession, PaymentError> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(request.amount));
        }
        if let Some(snapshot) = &request.snapshot {
            snapshot.validate_snapshot().map_err(PaymentError::Validation)?;
        }

        let expires_at = now + self.policy.session_expiry();
        let payment = self.insert_with_fresh_order_id(&request, expires_at, now).await?;

        let url_request = PaymentUrlRequest {
            order_id: payment.order_id.clone(),
            amount: payment.amount,
            order_info: request.order_info.clone(),
            client_ip: request.client_ip.clone(),
            created_at: now,
            expires_at,
        };

        let redirect_url = match self.codec.build_payment_url(&url_request) {
            Ok(url) => url,
            Err(e) => {
                warn!("Payment URL for {} could not be built, removing session: {}", payment.order_id, e);
                self.store.delete_pending_payment(&payment.order_id).await?;
                return Err(e.into());
            }
        };

        self.metrics.record_session_created();
        info!(
            "Payment session {} created: {:?} of {} for user {}",
            payment.order_id, payment.payment_type, payment.amount, payment.user_id
        );

        Ok(PaymentSession {
            order_id: payment.order_id,
            redirect_url,
            amount: payment.amount,
            payment_type: payment.payment_type,
            expires_at,
        })
    }

    async fn insert_with_fresh_order_id(
        &self,
        request: &SessionRequest,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Payment, PaymentError> {
        let mut last_conflict = String::new();

        for _ in 0..MAX_ORDER_ID_ATTEMPTS {
            let order_id = generate_order_id(&self.codec, now);
            let new = NewPayment {
                id: Uuid::new_v4(),
                order_id: order_id.clone(),
                user_id: request.user_id,
                bill_id: request.bill_id,
                amount: request.amount,
                payment_type: request.payment_type,
                payment_method: PaymentMethod::Vnpay,
                status: PaymentState::Pending,
                bill_data: request.snapshot.clone(),
                expires_at,
                created_at: now,
            };

            match self.store.insert_payment(new).await {
                Ok(payment) => return Ok(payment),
                Err(StoreError::Conflict(message)) => {
                    // Only an order id collision is worth another attempt
                    if self.store.find_payment(&order_id).await?.is_none() {
                        return Err(PaymentError::Conflict(message));
                    }
                    warn!("Order id {} collided, generating another", order_id);
                    last_conflict = message;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PaymentError::Conflict(last_conflict))
    }

    /// Session lookup for the client polling after the redirect
    pub async fn session_status(&self, order_id: &str, user_id: i32) -> Result<Payment, PaymentError> {
        match self.store.find_payment(order_id).await? {
            Some(payment) if payment.user_id == user_id => Ok(payment),
            _ => Err(PaymentError::NotFound(order_id.to_string())),
        }
    }
}
