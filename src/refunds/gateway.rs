use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

/// What is sent to the gateway to reverse an online payment
#[derive(Debug, Clone)]
pub struct RefundGatewayRequest {
    pub bill_id: Uuid,
    /// Gateway transaction number of the payment being reversed
    pub transaction_no: Option<String>,
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundReceipt {
    pub transaction_no: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RefundGatewayError {
    #[error("Refund declined by gateway: {0}")]
    Declined(String),

    #[error("Refund gateway unavailable: {0}")]
    Unavailable(String),
}

/// Refund side of the payment gateway
#[axum::async_trait]
pub trait RefundGateway: Send + Sync {
    async fn refund(&self, request: &RefundGatewayRequest) -> Result<RefundReceipt, RefundGatewayError>;
}

/// Stand-in for the gateway refund API: waits `latency`, then approves
#[derive(Debug, Clone, Default)]
pub struct SimulatedRefundGateway {
    latency: Duration,
}

impl SimulatedRefundGateway {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[axum::async_trait]
impl RefundGateway for SimulatedRefundGateway {
    async fn refund(&self, request: &RefundGatewayRequest) -> Result<RefundReceipt, RefundGatewayError> {
        if request.amount <= Decimal::ZERO {
            return Err(RefundGatewayError::Declined(format!("amount {} is not refundable", request.amount)));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
        let transaction_no = format!("RF{}{:04}", Utc::now().format("%Y%m%d%H%M%S"), suffix);
        debug!(
            "Simulated refund {} of {} for bill {}",
            transaction_no, request.amount, request.bill_id
        );
        Ok(RefundReceipt { transaction_no })
    }
}
