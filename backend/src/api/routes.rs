//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::error::{JsonPayloadError, QueryPayloadError};
use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// This function is called from main.rs to set up
/// all the endpoint routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                        GET
/// ├── /auth/otp
/// │   ├── /send                      POST
/// │   └── /verify                    POST
/// ├── /bookings                      POST
/// │   ├── /{id}                      GET
/// │   └── /{id}/cancel               POST
/// ├── /payments                      POST
/// │   ├── /methods                   GET
/// │   ├── /status                    GET  ?transactionId=
/// │   ├── /webhook                   POST (raw body, Stripe-Signature)
/// │   ├── /{id}/qr                   GET  (image/png)
/// │   └── /{id}/verify|confirm|regenerate|refund|cancel   POST
/// └── /admin
///     ├── /payments/security-report  GET
///     ├── /payments/{id}/unlock      POST
///     ├── /payments/{id}/regenerate  POST
///     ├── /bookings/{id}/no-show     POST
///     ├── /bookings/{id}/complete    POST
///     └── /users/{phone}/unlock      POST
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Malformed bodies and queries get the standard error envelope
        .app_data(
            web::JsonConfig::default().error_handler(handlers::bad_payload::<JsonPayloadError>),
        )
        .app_data(
            web::QueryConfig::default().error_handler(handlers::bad_payload::<QueryPayloadError>),
        )

        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        .service(
            web::scope("/auth/otp")
                .route("/send", web::post().to(handlers::send_otp))
                .route("/verify", web::post().to(handlers::verify_otp)),
        )

        .service(
            web::scope("/bookings")
                .route("", web::post().to(handlers::create_booking))
                .route("/{id}", web::get().to(handlers::get_booking))
                .route("/{id}/cancel", web::post().to(handlers::cancel_booking)),
        )

        .service(
            web::scope("/payments")
                .route("", web::post().to(handlers::create_payment))
                .route("/methods", web::get().to(handlers::payment_methods))
                .route("/status", web::get().to(handlers::payment_status))

                // Gateway callbacks; authenticated by signature, not session
                .route("/webhook", web::post().to(handlers::payment_webhook))

                .route("/{id}/qr", web::get().to(handlers::payment_qr_code))
                .route("/{id}/verify", web::post().to(handlers::verify_payment))
                .route("/{id}/confirm", web::post().to(handlers::confirm_payment))
                .route("/{id}/regenerate", web::post().to(handlers::regenerate_payment))
                .route("/{id}/refund", web::post().to(handlers::refund_payment))
                .route("/{id}/cancel", web::post().to(handlers::cancel_payment)),
        )

        // Operator tools
        .service(
            web::scope("/admin")
                .route(
                    "/payments/security-report",
                    web::get().to(handlers::security_report),
                )
                .route("/payments/{id}/unlock", web::post().to(handlers::unlock_payment))
                .route(
                    "/payments/{id}/regenerate",
                    web::post().to(handlers::admin_regenerate_payment),
                )
                .route("/bookings/{id}/no-show", web::post().to(handlers::mark_no_show))
                .route("/bookings/{id}/complete", web::post().to(handlers::complete_booking))
                .route("/users/{phone}/unlock", web::post().to(handlers::unlock_user)),
        );
}
