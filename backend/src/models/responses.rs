//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    BookingContext, BookingPaymentStatus, BookingRecord, BookingStatus, PaymentMethod,
    PaymentRecord, PaymentStatus, SecurityReport, TimeSlotRecord, UserRecord,
};
use crate::services::payment_manager::PaymentStatusView;
use crate::services::FieldError;
use crate::utils;

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "RESOURCE_CONFLICT",
///         "message": "Time slot is no longer available"
///     }
/// }
/// ```
///
/// Validation failures add `error.details`, one entry per offending field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            }),
        }
    }

    /// Create an error response carrying per-field details.
    pub fn error_with_details(code: &str, message: &str, details: Vec<FieldError>) -> Self {
        let mut response = Self::error(code, message);
        if let Some(error) = response.error.as_mut() {
            error.details = Some(details);
        }
        response
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "RESOURCE_CONFLICT").
    pub code: String,

    /// Human-readable error message.
    pub message: String,

    /// Field-level messages for validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// AUTH
// ============================================

/// Returned by `POST /auth/otp/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpSentResponse {
    /// Masked, e.g. "+91********10".
    pub phone_number: String,
    pub expires_at: DateTime<Utc>,
    /// Only present when debug secrets are exposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_code: Option<String>,
}

/// Returned by `POST /auth/otp/verify`.
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "token": "k3J9...",
///         "user": { "id": "...", "phoneNumber": "+919876543210", ... },
///         "isNewUser": true
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Bearer credential for subsequent requests.
    pub token: String,
    pub user: UserResponse,
    pub is_new_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub phone_number: String,
    pub email: Option<String>,
    pub is_phone_verified: bool,
    pub is_locked: bool,
    pub failed_login_attempts: i32,
    pub date_joined: DateTime<Utc>,
}

impl From<&UserRecord> for UserResponse {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            phone_number: user.phone_number.clone(),
            email: user.email.clone(),
            is_phone_verified: user.is_phone_verified,
            is_locked: user.is_locked,
            failed_login_attempts: user.failed_login_attempts,
            date_joined: user.date_joined,
        }
    }
}

// ============================================
// BOOKINGS
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotResponse {
    pub id: i64,
    pub club_id: i64,
    pub club_name: String,
    pub date: NaiveDate,
    /// "HH:MM", UTC.
    pub start_time: String,
    pub end_time: String,
    pub sport: String,
    pub max_capacity: i32,
    pub current_bookings: i32,
    pub is_available: bool,
    /// Price in paise.
    pub price: i64,
    /// Human-readable price (e.g., "₹750.00").
    pub formatted_price: String,
}

impl From<&TimeSlotRecord> for SlotResponse {
    fn from(slot: &TimeSlotRecord) -> Self {
        Self {
            id: slot.id,
            club_id: slot.club_id,
            club_name: slot.club_name.clone(),
            date: slot.date,
            start_time: slot.start_time.format("%H:%M").to_string(),
            end_time: slot.end_time.format("%H:%M").to_string(),
            sport: slot.sport.clone(),
            max_capacity: slot.max_capacity,
            current_bookings: slot.current_bookings,
            is_available: slot.is_available,
            price: slot.effective_price(),
            formatted_price: utils::format_inr(slot.effective_price()),
        }
    }
}

/// A booking with its slot and payment.
///
/// Returned by `POST /bookings` and `GET /bookings/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: BookingStatus,
    pub payment_status: BookingPaymentStatus,
    pub total_amount: i64,
    pub formatted_amount: String,
    pub special_requests: String,
    pub booking_date: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: String,
    pub slot: SlotResponse,
    pub payment: Option<PaymentResponse>,
}

impl BookingResponse {
    pub fn new(
        booking: &BookingRecord,
        slot: &TimeSlotRecord,
        payment: Option<&PaymentRecord>,
    ) -> Self {
        Self {
            id: booking.id,
            user_id: booking.user_id,
            status: booking.status,
            payment_status: booking.payment_status,
            total_amount: booking.total_amount,
            formatted_amount: utils::format_inr(booking.total_amount),
            special_requests: booking.special_requests.clone(),
            booking_date: booking.booking_date,
            cancelled_at: booking.cancelled_at,
            cancellation_reason: booking.cancellation_reason.clone(),
            slot: SlotResponse::from(slot),
            payment: payment.map(|p| PaymentResponse::new(p, false)),
        }
    }
}

impl From<&BookingContext> for BookingResponse {
    fn from(ctx: &BookingContext) -> Self {
        Self::new(&ctx.booking, &ctx.slot, ctx.payment.as_ref())
    }
}

/// Returned by `POST /bookings/{id}/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBookingResponse {
    pub booking: BookingResponse,
    /// The booking was paid and a refund has been requested.
    pub refund_due: bool,
}

// ============================================
// PAYMENTS
// ============================================

/// A payment as shown to its owner.
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "id": "...",
///         "transactionId": "TXN1767225600AB12CD34",
///         "amount": 75000,
///         "formattedAmount": "₹750.00",
///         "paymentMethod": "upi",
///         "status": "pending",
///         "qrPayload": "upi://pay?pa=sportsclub@upi&...",
///         "expiresAt": "2026-01-01T00:10:00Z"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub amount: i64,
    pub formatted_amount: String,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// UPI reference to render as a QR code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<String>,

    /// For the client-side card form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_last_four: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_brand: Option<String>,

    /// Only present when debug secrets are exposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,
}

impl PaymentResponse {
    pub fn new(payment: &PaymentRecord, expose_debug_secrets: bool) -> Self {
        let pending = payment.status == PaymentStatus::Pending;
        Self {
            id: payment.id,
            booking_id: payment.booking_id,
            transaction_id: payment.transaction_id.clone(),
            amount: payment.amount,
            formatted_amount: utils::format_inr(payment.amount),
            payment_method: payment.payment_method,
            status: payment.status,
            expires_at: payment.expires_at,
            attempts: payment.attempts,
            is_locked: payment.is_locked,
            created_at: payment.created_at,
            completed_at: payment.completed_at,
            qr_payload: payment.qr_payload.clone().filter(|_| pending),
            client_secret: payment.gateway_client_secret.clone().filter(|_| pending),
            card_last_four: payment.card_last_four.clone(),
            card_brand: payment.card_brand.clone(),
            security_token: expose_debug_secrets.then(|| payment.security_token.clone()),
        }
    }
}

/// Returned by `GET /payments/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
    pub is_locked: bool,
    pub attempts_remaining: i32,
}

impl From<&PaymentStatusView> for PaymentStatusResponse {
    fn from(view: &PaymentStatusView) -> Self {
        Self {
            transaction_id: view.payment.transaction_id.clone(),
            status: view.payment.status,
            expires_at: view.payment.expires_at,
            is_expired: view.is_expired,
            is_locked: view.payment.is_locked,
            attempts_remaining: view.attempts_remaining,
        }
    }
}

/// Returned by `POST /payments/webhook`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAckResponse {
    pub received: bool,
    /// applied, duplicate or ignored.
    pub outcome: String,
}

/// One entry of `GET /payments/methods`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodResponse {
    pub id: PaymentMethod,
    pub name: String,
    pub description: String,
    /// Icon key the clients map to an asset.
    pub icon: String,
    pub enabled: bool,
}

impl PaymentMethodResponse {
    /// Every method the service accepts.
    pub fn catalog() -> Vec<Self> {
        PaymentMethod::ALL.into_iter().map(Self::from).collect()
    }
}

impl From<PaymentMethod> for PaymentMethodResponse {
    fn from(method: PaymentMethod) -> Self {
        let (name, description, icon) = match method {
            PaymentMethod::Upi => (
                "QR Code / UPI",
                "Scan the QR code with any UPI app",
                "qr-code",
            ),
            PaymentMethod::StripeCard => (
                "Credit/Debit Card",
                "Pay securely with your card",
                "credit-card",
            ),
            PaymentMethod::StripeWallet => (
                "Digital Wallet",
                "Apple Pay or Google Pay",
                "wallet",
            ),
        };
        Self {
            id: method,
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
            enabled: true,
        }
    }
}

// ============================================
// ADMIN
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedPaymentSummary {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub admin_notes: String,
}

/// Returned by `GET /admin/payments/security-report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReportResponse {
    pub locked_payments: i64,
    pub suspicious_payments: i64,
    pub recent_locked: Vec<LockedPaymentSummary>,
}

impl From<&SecurityReport> for SecurityReportResponse {
    fn from(report: &SecurityReport) -> Self {
        Self {
            locked_payments: report.locked_payments,
            suspicious_payments: report.suspicious_payments,
            recent_locked: report
                .recent_locked
                .iter()
                .map(|p| LockedPaymentSummary {
                    id: p.id,
                    booking_id: p.booking_id,
                    transaction_id: p.transaction_id.clone(),
                    attempts: p.attempts,
                    last_attempt_at: p.last_attempt_at,
                    admin_notes: p.admin_notes.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let response = ApiResponse::<()>::error_with_details(
            "VALIDATION_ERROR",
            "Invalid input",
            vec![FieldError::new("clubId", "Must be a positive id")],
        );
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["success"], false);
        assert!(json["data"].is_null());
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(json["error"]["details"][0]["field"], "clubId");
    }

    #[test]
    fn test_plain_error_omits_details() {
        let json = serde_json::to_value(ApiResponse::<()>::error("NOT_FOUND", "x")).unwrap();
        assert!(json["error"].get("details").is_none());
    }
}
