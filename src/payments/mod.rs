// Payment sessions against the redirect gateway and reconciliation of its callbacks

pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod reconciliation;
pub mod session;

pub use error::PaymentError;
pub use gateway::{GatewayCodec, GatewayError};
pub use handlers::*;
pub use models::*;
pub use reconciliation::ReconciliationProcessor;
pub use session::{PaymentSessionManager, SessionRequest};
