// Refunds of online payments on cancellation

pub mod engine;
pub mod gateway;
pub mod handlers;
pub mod models;

pub use engine::{RefundEngine, RefundError};
pub use gateway::{RefundGateway, SimulatedRefundGateway};
pub use handlers::*;
pub use models::*;
