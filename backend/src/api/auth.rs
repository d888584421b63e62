//! # Request Authentication
//!
//! Extractors that gate handlers:
//!
//! | Extractor | Header | Rejection |
//! |-----------|--------|-----------|
//! | `AuthenticatedUser` | `Authorization: Bearer <token>` | 401 `UNAUTHORIZED` |
//! | `AdminAccess` | `X-Admin-Key: <key>` | 403 `FORBIDDEN` |
//!
//! Handlers that list one of these as a parameter never run for a
//! request that fails the check.

use std::sync::Arc;

use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::http::{header, StatusCode};
use actix_web::{web, FromRequest, HttpRequest, HttpResponse};
use chrono::Utc;
use futures::future::{ready, LocalBoxFuture, Ready};
use tracing::warn;

use crate::models::ApiResponse;
use crate::services::session::Session;
use crate::utils;
use crate::AppState;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Turn a rejection into an actix error carrying our JSON envelope.
fn reject(status: StatusCode, code: &str, message: &str) -> actix_web::Error {
    let response = HttpResponse::build(status).json(ApiResponse::<()>::error(code, message));
    InternalError::from_response(message.to_string(), response).into()
}

fn app_state(req: &HttpRequest) -> Result<Arc<AppState>, actix_web::Error> {
    req.app_data::<web::Data<Arc<AppState>>>()
        .map(|data| data.get_ref().clone())
        .ok_or_else(|| {
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Application state missing",
            )
        })
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// The customer a bearer credential was issued to.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Session);

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let state = app_state(req);
        let token = bearer_token(req);

        Box::pin(async move {
            let state = state?;
            let token = token.ok_or_else(|| {
                reject(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Missing bearer token")
            })?;

            state
                .sessions
                .resolve(&token, Utc::now())
                .await
                .map(AuthenticatedUser)
                .ok_or_else(|| {
                    reject(
                        StatusCode::UNAUTHORIZED,
                        "UNAUTHORIZED",
                        "Session is invalid or has expired",
                    )
                })
        })
    }
}

/// Proof the caller presented the configured admin key.
///
/// With no `ADMIN_API_KEY` configured every admin request is refused.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequest for AdminAccess {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(check_admin(req))
    }
}

fn check_admin(req: &HttpRequest) -> Result<AdminAccess, actix_web::Error> {
    let state = app_state(req)?;
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return Err(reject(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "Admin access is disabled",
        ));
    };

    let presented = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if utils::constant_time_eq(presented, expected) {
        Ok(AdminAccess)
    } else {
        warn!("Rejected admin request to {}", req.path());
        Err(reject(StatusCode::FORBIDDEN, "FORBIDDEN", "Invalid admin key"))
    }
}
