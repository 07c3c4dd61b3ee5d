// Reservations: bill model, lifecycle transitions and the booking flow

pub mod error;
pub mod handlers;
pub mod models;
pub mod service;
pub mod status_machine;

pub use error::BookingError;
pub use handlers::*;
pub use models::*;
pub use service::{BookingService, Customer};
pub use status_machine::*;
