//! # REST API Module
//!
//! This module defines all HTTP endpoints for the booking backend.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | GET | `/health` | - | Health check |
//! | POST | `/auth/otp/send` | - | Send a login code |
//! | POST | `/auth/otp/verify` | - | Log in with a code |
//! | POST | `/bookings` | user | Book a time slot |
//! | GET | `/bookings/{id}` | user | Booking with slot and payment |
//! | POST | `/bookings/{id}/cancel` | user | Cancel a booking |
//! | POST | `/payments` | user | Start a payment |
//! | GET | `/payments/methods` | user | Accepted payment methods |
//! | GET | `/payments/status?transactionId=` | user | Payment status |
//! | GET | `/payments/{id}/qr` | user | QR code image (PNG) |
//! | POST | `/payments/{id}/verify` | user | Confirm a QR payment |
//! | POST | `/payments/{id}/confirm` | user | Confirm a card payment |
//! | POST | `/payments/{id}/regenerate` | user | New QR for an expired payment |
//! | POST | `/payments/{id}/refund` | user | Refund a completed payment |
//! | POST | `/payments/{id}/cancel` | user | Abandon a pending payment |
//! | POST | `/payments/webhook` | signature | Gateway events |
//! | POST | `/admin/payments/{id}/unlock` | admin | Clear a payment lockout |
//! | POST | `/admin/payments/{id}/regenerate` | admin | Force a new QR |
//! | GET | `/admin/payments/security-report` | admin | Lockout summary |
//! | POST | `/admin/bookings/{id}/no-show` | admin | Mark a no-show |
//! | POST | `/admin/bookings/{id}/complete` | admin | Mark completed |
//! | POST | `/admin/users/{phone}/unlock` | admin | Clear a login lockout |
//!
//! `user` endpoints take `Authorization: Bearer <token>` from
//! `/auth/otp/verify`. `admin` endpoints take `X-Admin-Key`.
//!
//! ## Request/Response Format
//!
//! All requests and responses use JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "VALIDATION_ERROR",
//!         "message": "Human readable message",
//!         "details": [{ "field": "timeSlotId", "message": "..." }]
//!     }
//! }
//! ```

pub mod auth;
pub mod routes;
pub mod handlers;

pub use routes::configure_routes;
