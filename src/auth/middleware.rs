// Authentication middleware for protected routes

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::auth::{error::AuthError, models::Role, token::TokenService};
use crate::loyalty::AccountId;

/// The account a bearer token was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedAccount {
    pub account_id: AccountId,
    pub role: Role,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidToken)?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidToken)
}

fn authenticate(headers: &HeaderMap, tokens: &TokenService) -> Result<AuthenticatedAccount, AuthError> {
    let claims = tokens.validate_token(bearer_token(headers)?)?;
    Ok(AuthenticatedAccount {
        account_id: claims.sub,
        role: claims.role,
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedAccount
where
    Arc<TokenService>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        // set by require_admin when it already validated the token
        if let Some(account) = parts.extensions.get::<AuthenticatedAccount>() {
            return Ok(*account);
        }

        let tokens = Arc::<TokenService>::from_ref(state);
        authenticate(&parts.headers, &tokens)
    }
}

/// Rejects requests whose token does not carry the admin role
pub async fn require_admin(
    State(tokens): State<Arc<TokenService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let endpoint = request.uri().path().to_string();

    let account = authenticate(request.headers(), &tokens).map_err(|e| {
        warn!("Rejected request to admin endpoint {}: {}", endpoint, e);
        e
    })?;

    if account.role != Role::Admin {
        warn!(
            "Authorization failed: account_id={}, role={}, endpoint={}",
            account.account_id, account.role, endpoint
        );
        return Err(AuthError::InsufficientPermissions {
            required: Role::Admin,
            actual: account.role,
        });
    }

    debug!(
        "Authorization successful: account_id={}, endpoint={}",
        account.account_id, endpoint
    );
    request.extensions_mut().insert(account);
    Ok(next.run(request).await)
}
