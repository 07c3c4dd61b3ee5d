// Authentication module
// Bearer JWTs identify the customer and carry their tier; accounts live elsewhere

pub mod error;
pub mod middleware;
pub mod token;

pub use error::AuthError;
pub use middleware::AuthenticatedUser;
pub use token::{Claims, TokenService};
