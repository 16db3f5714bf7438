// Authentication module
// Bearer JWTs identify the loyalty account; admin routes also check the role claim

pub mod error;
pub mod middleware;
pub mod models;
pub mod token;

// Re-export commonly used types
pub use error::AuthError;
pub use middleware::{require_admin, AuthenticatedAccount};
pub use models::Role;
pub use token::{Claims, TokenService};
