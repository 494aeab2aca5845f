//! Request authentication middleware.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use parley_auth::Claims;
use std::sync::Arc;

use crate::AppState;

/// Verified identity claims for the current request, stored in request
/// extensions by [`auth_middleware`].
#[derive(Clone, Debug)]
pub struct AuthContext(pub Claims);

/// Middleware to authenticate requests via `Authorization: Bearer <token>`.
///
/// The token is a signed access token issued by the auth endpoints; identity
/// comes entirely from the verified claims, so no database read happens here.
/// Missing, malformed, expired, or badly signed tokens are all `401`.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let claims = parley_auth::verify_access_token(&state.jwt_secret, &token).map_err(|e| {
        tracing::debug!(error = %e, "bearer token verification failed");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(AuthContext(claims));

    Ok(next.run(req).await)
}
