//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts request data (and the caller, via `auth` extractors)
//! 2. Validates input
//! 3. Calls the appropriate service
//! 4. Returns a formatted response
//!
//! ## Error Handling
//!
//! Every `ServiceError` is mapped to a status code and returned as JSON:
//!
//! | Error code | HTTP |
//! |------------|------|
//! | `VALIDATION_ERROR`, `TOKEN_MISMATCH`, `INVALID_SIGNATURE` | 400 |
//! | `PAYMENT_DECLINED` | 402 |
//! | `NOT_FOUND` | 404 |
//! | `RESOURCE_CONFLICT`, `DUPLICATE_ACTIVE_PAYMENT`, `INVALID_STATE`, `CANCELLATION_WINDOW_CLOSED`, blocked payments | 409 |
//! | `EXPIRED` | 410 |
//! | `SECURITY_LOCKOUT`, `TOO_MANY_ATTEMPTS` | 423 |
//! | `RATE_LIMITED` | 429 |
//! | `INTERNAL_ERROR` | 500 |
//! | `GATEWAY_UNAVAILABLE` | 503 |
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "RESOURCE_CONFLICT",
//!         "message": "Time slot is fully booked"
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use actix_web::error::InternalError;
use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{AdminAccess, AuthenticatedUser};
use crate::models::{
    ApiResponse, BookingResponse, CancelBookingRequest, CancelBookingResponse,
    ConfirmPaymentRequest, CreateBookingRequest, CreatePaymentRequest, HealthResponse,
    LoginResponse, OtpSentResponse, PaymentMethodResponse, PaymentResponse, PaymentStatusQuery,
    PaymentStatusResponse, SecurityReportResponse, SendOtpRequest, UserResponse,
    VerifyOtpRequest, VerifyPaymentRequest, WebhookAckResponse,
};
use crate::services::payment_manager::WebhookOutcome;
use crate::services::ServiceError;
use crate::utils;
use crate::AppState;

/// Header the gateway signs webhook deliveries with.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

// ============================================
// ERROR MAPPING
// ============================================

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Validation(_)
        | ServiceError::TokenMismatch
        | ServiceError::InvalidSignature => StatusCode::BAD_REQUEST,
        ServiceError::GatewayDefinitive(_) => StatusCode::PAYMENT_REQUIRED,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::ResourceConflict(_)
        | ServiceError::DuplicateActivePayment { .. }
        | ServiceError::InvalidTransition(_)
        | ServiceError::PaymentBlocked(_)
        | ServiceError::CancellationWindowClosed(_) => StatusCode::CONFLICT,
        ServiceError::Expired(_) => StatusCode::GONE,
        ServiceError::SecurityLockout(_) | ServiceError::TooManyAttempts(_) => StatusCode::LOCKED,
        ServiceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::GatewayTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Storage(_) | ServiceError::Rendering(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Render a service failure as the standard error envelope.
pub fn error_response(err: &ServiceError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected ({}): {}", err.code(), err);
    }

    let body = match err.field_errors() {
        Some(fields) => {
            ApiResponse::<()>::error_with_details(err.code(), &err.public_message(), fields.to_vec())
        }
        None => ApiResponse::<()>::error(err.code(), &err.public_message()),
    };
    HttpResponse::build(status).json(body)
}

/// Error handler for malformed JSON bodies and query strings.
pub fn bad_payload<E>(err: E, _req: &HttpRequest) -> actix_web::Error
where
    E: fmt::Debug + fmt::Display + 'static,
{
    let response = HttpResponse::BadRequest()
        .json(ApiResponse::<()>::error("VALIDATION_ERROR", &err.to_string()));
    InternalError::from_response(err, response).into()
}

// ============================================
// INFO
// ============================================

/// API information endpoint (root).
///
/// ## Endpoint
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Sports Booking API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Slot booking, payments and OTP login for sports facilities",
        "endpoints": {
            "health": { "method": "GET", "path": "/health" },
            "auth": {
                "sendOtp": { "method": "POST", "path": "/auth/otp/send" },
                "verifyOtp": { "method": "POST", "path": "/auth/otp/verify" }
            },
            "bookings": {
                "create": { "method": "POST", "path": "/bookings" },
                "get": { "method": "GET", "path": "/bookings/{id}" },
                "cancel": { "method": "POST", "path": "/bookings/{id}/cancel" }
            },
            "payments": {
                "create": { "method": "POST", "path": "/payments" },
                "methods": { "method": "GET", "path": "/payments/methods" },
                "status": { "method": "GET", "path": "/payments/status?transactionId=" },
                "qr": { "method": "GET", "path": "/payments/{id}/qr" },
                "verify": { "method": "POST", "path": "/payments/{id}/verify" },
                "confirm": { "method": "POST", "path": "/payments/{id}/confirm" },
                "regenerate": { "method": "POST", "path": "/payments/{id}/regenerate" },
                "refund": { "method": "POST", "path": "/payments/{id}/refund" },
                "cancel": { "method": "POST", "path": "/payments/{id}/cancel" },
                "webhook": { "method": "POST", "path": "/payments/webhook" }
            }
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// ## Endpoint
///
/// `GET /health`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "database": "ok",
///         "timestamp": "2026-01-01T12:00:00Z"
///     }
/// }
/// ```
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let db_result = state.store.health_check().await;
    if let Err(e) = &db_result {
        warn!("Health check: store unavailable: {}", e);
    }
    let healthy = db_result.is_ok();

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database: if healthy { "ok" } else { "unavailable" }.to_string(),
        timestamp: Utc::now(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

// ============================================
// AUTH
// ============================================

/// Send a one-time login code by SMS.
///
/// ## Endpoint
///
/// `POST /auth/otp/send`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/auth/otp/send \
///   -H "Content-Type: application/json" \
///   -d '{ "phoneNumber": "+919876543210" }'
/// ```
pub async fn send_otp(
    state: web::Data<Arc<AppState>>,
    body: web::Json<SendOtpRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }

    match state.otp.send(&body.phone_number).await {
        Ok(issued) => HttpResponse::Ok().json(ApiResponse::success(OtpSentResponse {
            phone_number: utils::mask_phone(&body.phone_number),
            expires_at: issued.expires_at,
            debug_code: issued.debug_code,
        })),
        Err(e) => error_response(&e),
    }
}

/// Log in with a received code.
///
/// ## Endpoint
///
/// `POST /auth/otp/verify`
///
/// The returned `token` goes in `Authorization: Bearer <token>` on
/// every customer endpoint.
pub async fn verify_otp(
    state: web::Data<Arc<AppState>>,
    body: web::Json<VerifyOtpRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }

    match state.otp.verify(&body.phone_number, &body.code).await {
        Ok(login) => HttpResponse::Ok().json(ApiResponse::success(LoginResponse {
            token: login.token,
            user: UserResponse::from(&login.user),
            is_new_user: login.new_user,
        })),
        Err(e) => error_response(&e),
    }
}

// ============================================
// BOOKINGS
// ============================================

/// Book one unit of a time slot.
///
/// ## Endpoint
///
/// `POST /bookings`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/bookings \
///   -H "Authorization: Bearer $TOKEN" \
///   -H "Content-Type: application/json" \
///   -d '{ "clubId": 4, "timeSlotId": 112 }'
/// ```
///
/// Returns `201` with the pending booking, or `409 RESOURCE_CONFLICT`
/// when the slot is full.
pub async fn create_booking(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    body: web::Json<CreateBookingRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }
    info!("Booking request from {} for slot {}", user.0.user_id, body.time_slot_id);

    let request = body.into_inner().into_new_booking(user.0.user_id);
    match state.bookings.create(request).await {
        Ok((booking, slot)) => HttpResponse::Created()
            .json(ApiResponse::success(BookingResponse::new(&booking, &slot, None))),
        Err(e) => error_response(&e),
    }
}

/// Booking with its slot and current payment.
///
/// ## Endpoint
///
/// `GET /bookings/{id}`
pub async fn get_booking(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.bookings.get(path.into_inner(), user.0.user_id).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(BookingResponse::from(&ctx))),
        Err(e) => error_response(&e),
    }
}

/// Cancel a booking. The body is optional.
///
/// ## Endpoint
///
/// `POST /bookings/{id}/cancel`
///
/// ```json
/// { "reason": "Rained out" }
/// ```
///
/// `refundDue` is true when the booking was already paid.
pub async fn cancel_booking(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: Option<web::Json<CancelBookingRequest>>,
) -> HttpResponse {
    let body = body.map(|b| b.into_inner()).unwrap_or_default();
    if let Err(e) = body.validate() {
        return error_response(&e);
    }

    match state
        .bookings
        .cancel(path.into_inner(), user.0.user_id, &body.reason)
        .await
    {
        Ok(cancellation) => HttpResponse::Ok().json(ApiResponse::success(CancelBookingResponse {
            booking: BookingResponse::from(&cancellation.context),
            refund_due: cancellation.refund_due,
        })),
        Err(e) => error_response(&e),
    }
}

// ============================================
// PAYMENTS
// ============================================

/// Start paying for a pending booking.
///
/// ## Endpoint
///
/// `POST /payments`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/payments \
///   -H "Authorization: Bearer $TOKEN" \
///   -H "Content-Type: application/json" \
///   -d '{ "bookingId": "6f1c...", "paymentMethod": "upi" }'
/// ```
///
/// UPI payments carry a `qrPayload`; card payments carry the gateway
/// `clientSecret` for the card form.
pub async fn create_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    body: web::Json<CreatePaymentRequest>,
) -> HttpResponse {
    let method = match body.validate() {
        Ok(method) => method,
        Err(e) => return error_response(&e),
    };

    match state
        .payments
        .create(body.booking_id, user.0.user_id, method)
        .await
    {
        Ok(ctx) => HttpResponse::Created().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// Payment status by transaction id.
///
/// ## Endpoint
///
/// `GET /payments/status?transactionId=TXN...`
pub async fn payment_status(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    query: web::Query<PaymentStatusQuery>,
) -> HttpResponse {
    if let Err(e) = query.validate() {
        return error_response(&e);
    }

    match state.payments.status(&query.transaction_id, user.0.user_id).await {
        Ok(view) => HttpResponse::Ok().json(ApiResponse::success(PaymentStatusResponse::from(&view))),
        Err(e) => error_response(&e),
    }
}

/// Payment methods a booking can be paid with.
///
/// ## Endpoint
///
/// `GET /payments/methods`
pub async fn payment_methods(_user: AuthenticatedUser) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(PaymentMethodResponse::catalog()))
}

/// QR code image of a pending UPI payment.
///
/// ## Endpoint
///
/// `GET /payments/{id}/qr`
///
/// Responds with `image/png`. The image is never cached, and a failed
/// integrity check counts as an attempt exactly like `/verify`.
pub async fn payment_qr_code(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let ctx = match state.payments.qr_code(path.into_inner(), user.0.user_id).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let Some(image) = ctx.payment.qr_image else {
        return error_response(&ServiceError::not_found("QR code"));
    };

    HttpResponse::Ok()
        .content_type("image/png")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"qr_{}.png\"", ctx.payment.transaction_id),
        ))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::EXPIRES, "0"))
        .insert_header((header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .insert_header((header::X_FRAME_OPTIONS, "DENY"))
        .body(image)
}

/// Confirm a UPI payment with the token from its QR reference.
///
/// ## Endpoint
///
/// `POST /payments/{id}/verify`
///
/// ```json
/// { "securityToken": "Yk2v..." }
/// ```
///
/// A wrong token counts as a failed attempt; enough of them lock the
/// payment (`423 SECURITY_LOCKOUT`) until an operator unlocks it.
pub async fn verify_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: web::Json<VerifyPaymentRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }

    match state
        .payments
        .verify(path.into_inner(), user.0.user_id, body.security_token.trim())
        .await
    {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// Confirm a card payment through the gateway.
///
/// ## Endpoint
///
/// `POST /payments/{id}/confirm`
///
/// ```json
/// { "paymentMethodToken": "pm_card_visa" }
/// ```
///
/// `503 GATEWAY_UNAVAILABLE` leaves the payment untouched and can be
/// retried; `402 PAYMENT_DECLINED` marks it failed.
pub async fn confirm_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
    body: web::Json<ConfirmPaymentRequest>,
) -> HttpResponse {
    if let Err(e) = body.validate() {
        return error_response(&e);
    }

    match state
        .payments
        .confirm(path.into_inner(), user.0.user_id, body.payment_method_token.trim())
        .await
    {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// New QR reference for an expired UPI payment.
///
/// ## Endpoint
///
/// `POST /payments/{id}/regenerate`
pub async fn regenerate_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.payments.regenerate(path.into_inner(), user.0.user_id).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// ## Endpoint
///
/// `POST /payments/{id}/refund`
pub async fn refund_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.payments.refund(path.into_inner(), user.0.user_id).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// ## Endpoint
///
/// `POST /payments/{id}/cancel`
pub async fn cancel_payment(
    state: web::Data<Arc<AppState>>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.payments.cancel(path.into_inner(), user.0.user_id).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// Gateway event delivery.
///
/// ## Endpoint
///
/// `POST /payments/webhook`
///
/// The raw body is checked against the `Stripe-Signature` header before
/// it is parsed. Redelivered events are acknowledged with
/// `"outcome": "duplicate"` and change nothing.
pub async fn payment_webhook(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    match state.payments.handle_webhook(&body, signature, Utc::now()).await {
        Ok(outcome) => {
            let outcome = match outcome {
                WebhookOutcome::Applied => "applied",
                WebhookOutcome::Duplicate => "duplicate",
                WebhookOutcome::Ignored => "ignored",
            };
            HttpResponse::Ok().json(ApiResponse::success(WebhookAckResponse {
                received: true,
                outcome: outcome.to_string(),
            }))
        }
        Err(e) => error_response(&e),
    }
}

fn payment_view(state: &AppState, payment: &crate::db::PaymentRecord) -> PaymentResponse {
    PaymentResponse::new(payment, state.config.expose_debug_secrets)
}

// ============================================
// ADMIN
// ============================================

/// Clear a payment lockout.
///
/// ## Endpoint
///
/// `POST /admin/payments/{id}/unlock`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/admin/payments/$ID/unlock \
///   -H "X-Admin-Key: $ADMIN_API_KEY"
/// ```
pub async fn unlock_payment(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
    path: web::Path<Uuid>,
) -> HttpResponse {
    let payment_id = path.into_inner();
    match state.payments.unlock(payment_id).await {
        Ok(ctx) => {
            info!("Admin unlocked payment {}", payment_id);
            HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment)))
        }
        Err(e) => error_response(&e),
    }
}

/// ## Endpoint
///
/// `POST /admin/payments/{id}/regenerate`
pub async fn admin_regenerate_payment(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.payments.admin_regenerate(path.into_inner()).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(payment_view(&state, &ctx.payment))),
        Err(e) => error_response(&e),
    }
}

/// Counts of locked and suspicious payments plus the latest lockouts.
///
/// ## Endpoint
///
/// `GET /admin/payments/security-report`
pub async fn security_report(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
) -> HttpResponse {
    match state.payments.security_report().await {
        Ok(report) => {
            HttpResponse::Ok().json(ApiResponse::success(SecurityReportResponse::from(&report)))
        }
        Err(e) => error_response(&e),
    }
}

/// ## Endpoint
///
/// `POST /admin/bookings/{id}/no-show`
pub async fn mark_no_show(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.bookings.mark_no_show(path.into_inner()).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(BookingResponse::from(&ctx))),
        Err(e) => error_response(&e),
    }
}

/// ## Endpoint
///
/// `POST /admin/bookings/{id}/complete`
pub async fn complete_booking(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
    path: web::Path<Uuid>,
) -> HttpResponse {
    match state.bookings.complete(path.into_inner()).await {
        Ok(ctx) => HttpResponse::Ok().json(ApiResponse::success(BookingResponse::from(&ctx))),
        Err(e) => error_response(&e),
    }
}

/// Clear a login lockout.
///
/// ## Endpoint
///
/// `POST /admin/users/{phone}/unlock`
///
/// The phone number is URL-encoded, e.g. `%2B919876543210`.
pub async fn unlock_user(
    state: web::Data<Arc<AppState>>,
    _admin: AdminAccess,
    path: web::Path<String>,
) -> HttpResponse {
    let phone = path.into_inner();
    match state.otp.unlock_user(&phone).await {
        Ok(user) => {
            info!("Admin unlocked user {}", utils::mask_phone(&phone));
            HttpResponse::Ok().json(ApiResponse::success(UserResponse::from(&user)))
        }
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::ADMIN_KEY_HEADER;
    use crate::api::configure_routes;
    use crate::config::AppConfig;
    use crate::db::{BookingStore, MemoryStore};
    use crate::services::gateway::sign_webhook_payload;
    use crate::services::{MockGateway, NotificationDispatcher};
    use actix_web::{test, App};
    use chrono::{NaiveDate, NaiveTime};
    use serde_json::Value;

    const ADMIN_KEY: &str = "admin-test-key";
    const WEBHOOK_SECRET: &str = "whsec_api_test";

    /// Call the service and read the JSON envelope.
    macro_rules! send {
        ($app:expr, $req:expr) => {{
            let resp = test::call_service($app, $req.to_request()).await;
            let status = resp.status();
            let body: Value = test::read_body_json(resp).await;
            (status, body)
        }};
    }

    /// OTP round trip; evaluates to the bearer token.
    macro_rules! login {
        ($app:expr, $phone:expr) => {{
            let (status, sent) = send!(
                $app,
                test::TestRequest::post()
                    .uri("/auth/otp/send")
                    .set_json(json!({ "phoneNumber": $phone }))
            );
            assert_eq!(status, StatusCode::OK);
            let code = sent["data"]["debugCode"].as_str().unwrap().to_string();

            let (status, login) = send!(
                $app,
                test::TestRequest::post()
                    .uri("/auth/otp/verify")
                    .set_json(json!({ "phoneNumber": $phone, "code": code }))
            );
            assert_eq!(status, StatusCode::OK);
            login["data"]["token"].as_str().unwrap().to_string()
        }};
    }

    fn test_config() -> AppConfig {
        AppConfig {
            expose_debug_secrets: true,
            admin_api_key: Some(ADMIN_KEY.to_string()),
            stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
            ..AppConfig::default()
        }
    }

    async fn test_state() -> (Arc<AppState>, i64, i64) {
        let store = MemoryStore::new();
        let club = store.add_club("Smash Arena", 60_000).await;
        let slot = store
            .add_slot(
                club,
                NaiveDate::from_ymd_opt(2035, 3, 14).unwrap(),
                NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
                "badminton",
                1,
                None,
            )
            .await
            .unwrap();

        let config = test_config();
        let store: Arc<dyn BookingStore> = Arc::new(store);
        let gateway = Arc::new(MockGateway::new(&config.stripe_webhook_secret));
        let (dispatcher, _rx) = NotificationDispatcher::new(64);
        let state = AppState::new(config, store, gateway, dispatcher);
        (Arc::new(state), club, slot.id)
    }

    #[actix_rt::test]
    async fn test_book_and_pay_by_qr() {
        let (state, club, slot) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        let token = login!(&app, "+919812345678");
        let bearer = ("Authorization", format!("Bearer {}", token));

        let (status, booking) = send!(
            &app,
            test::TestRequest::post()
                .uri("/bookings")
                .insert_header(bearer.clone())
                .set_json(json!({ "clubId": club, "timeSlotId": slot }))
        );
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(booking["data"]["status"], "pending");
        assert_eq!(booking["data"]["slot"]["currentBookings"], 1);
        let booking_id = booking["data"]["id"].as_str().unwrap().to_string();

        let (status, payment) = send!(
            &app,
            test::TestRequest::post()
                .uri("/payments")
                .insert_header(bearer.clone())
                .set_json(json!({ "bookingId": booking_id, "paymentMethod": "upi" }))
        );
        assert_eq!(status, StatusCode::CREATED);
        assert!(payment["data"]["qrPayload"].as_str().unwrap().starts_with("upi://pay"));
        let payment_id = payment["data"]["id"].as_str().unwrap().to_string();
        let security_token = payment["data"]["securityToken"].as_str().unwrap().to_string();

        let (status, verified) = send!(
            &app,
            test::TestRequest::post()
                .uri(&format!("/payments/{}/verify", payment_id))
                .insert_header(bearer.clone())
                .set_json(json!({ "securityToken": security_token }))
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["data"]["status"], "completed");

        let (status, booking) = send!(
            &app,
            test::TestRequest::get()
                .uri(&format!("/bookings/{}", booking_id))
                .insert_header(bearer)
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["data"]["status"], "confirmed");
        assert_eq!(booking["data"]["paymentStatus"], "completed");
    }

    #[actix_rt::test]
    async fn test_qr_code_image_is_served_uncached() {
        let (state, club, slot) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        let token = login!(&app, "+919812345670");
        let bearer = ("Authorization", format!("Bearer {}", token));

        let (status, methods) = send!(
            &app,
            test::TestRequest::get()
                .uri("/payments/methods")
                .insert_header(bearer.clone())
        );
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = methods["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["upi", "stripe_card", "stripe_wallet"]);

        let (_, booking) = send!(
            &app,
            test::TestRequest::post()
                .uri("/bookings")
                .insert_header(bearer.clone())
                .set_json(json!({ "clubId": club, "timeSlotId": slot }))
        );
        let booking_id = booking["data"]["id"].as_str().unwrap().to_string();
        let (_, payment) = send!(
            &app,
            test::TestRequest::post()
                .uri("/payments")
                .insert_header(bearer.clone())
                .set_json(json!({ "bookingId": booking_id, "paymentMethod": "upi" }))
        );
        let payment_id = payment["data"]["id"].as_str().unwrap().to_string();
        let transaction_id = payment["data"]["transactionId"].as_str().unwrap().to_string();

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/payments/{}/qr", payment_id))
                .insert_header(bearer)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(headers.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(
            headers.get(header::CONTENT_DISPOSITION).unwrap().to_str().unwrap(),
            format!("inline; filename=\"qr_{}.png\"", transaction_id)
        );
        let body = test::read_body(resp).await;
        assert!(body.starts_with(b"\x89PNG\r\n\x1a\n"));

        // Unauthenticated callers get nothing.
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/payments/{}/qr", payment_id))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn test_full_slot_is_conflict() {
        let (state, club, slot) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        let first = login!(&app, "+919811111111");
        let second = login!(&app, "+919822222222");

        let request = |token: &str| {
            test::TestRequest::post()
                .uri("/bookings")
                .insert_header(("Authorization", format!("Bearer {}", token)))
                .set_json(json!({ "clubId": club, "timeSlotId": slot }))
        };
        let (status, _) = send!(&app, request(&first));
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send!(&app, request(&second));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "RESOURCE_CONFLICT");
    }

    #[actix_rt::test]
    async fn test_requests_without_session_are_unauthorized() {
        let (state, club, slot) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let (status, body) = send!(
            &app,
            test::TestRequest::post()
                .uri("/bookings")
                .set_json(json!({ "clubId": club, "timeSlotId": slot }))
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = send!(
            &app,
            test::TestRequest::post()
                .uri("/bookings")
                .insert_header(("Authorization", "Bearer not-a-session"))
                .set_json(json!({ "clubId": club, "timeSlotId": slot }))
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn test_validation_errors_list_every_field() {
        let (state, _, _) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;
        let token = login!(&app, "+919833333333");

        let (status, body) = send!(
            &app,
            test::TestRequest::post()
                .uri("/bookings")
                .insert_header(("Authorization", format!("Bearer {}", token)))
                .set_json(json!({ "clubId": 0, "timeSlotId": 0 }))
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"].as_array().unwrap().len(), 2);

        let (status, body) = send!(
            &app,
            test::TestRequest::post()
                .uri("/auth/otp/send")
                .insert_header(("Content-Type", "application/json"))
                .set_payload("{not json")
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[actix_rt::test]
    async fn test_admin_routes_require_key() {
        let (state, _, _) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let (status, body) = send!(
            &app,
            test::TestRequest::get().uri("/admin/payments/security-report")
        );
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (status, body) = send!(
            &app,
            test::TestRequest::get()
                .uri("/admin/payments/security-report")
                .insert_header((ADMIN_KEY_HEADER, ADMIN_KEY))
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["lockedPayments"], 0);
    }

    #[actix_rt::test]
    async fn test_webhook_checks_signature() {
        let (state, _, _) = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let payload = json!({
            "id": "evt_unknown",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_not_ours" } }
        })
        .to_string();

        let forged = sign_webhook_payload(payload.as_bytes(), "whsec_wrong", Utc::now().timestamp());
        let (status, body) = send!(
            &app,
            test::TestRequest::post()
                .uri("/payments/webhook")
                .insert_header((SIGNATURE_HEADER, forged))
                .set_payload(payload.clone())
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

        let signed = sign_webhook_payload(payload.as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp());
        let (status, body) = send!(
            &app,
            test::TestRequest::post()
                .uri("/payments/webhook")
                .insert_header((SIGNATURE_HEADER, signed))
                .set_payload(payload)
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "ignored");
    }

    #[actix_rt::test]
    async fn test_error_status_mapping() {
        assert_eq!(
            status_for(&ServiceError::TooManyAttempts("x".into())),
            StatusCode::LOCKED
        );
        assert_eq!(
            status_for(&ServiceError::GatewayTransient("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ServiceError::not_found("Booking")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&ServiceError::TokenMismatch), StatusCode::BAD_REQUEST);
    }
}
