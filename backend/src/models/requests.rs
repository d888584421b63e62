//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Each struct represents the expected JSON body for an endpoint.
//!
//! Every request has a `validate()` that checks all fields before any
//! entity is touched and reports every offending field at once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::PaymentMethod;
use crate::services::booking_lifecycle::NewBooking;
use crate::services::{FieldError, ServiceError};
use crate::utils;

/// Longest free-text field we accept.
const MAX_TEXT_LEN: usize = 500;

fn finish(errors: Vec<FieldError>) -> Result<(), ServiceError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Validation(errors))
    }
}

/// Request an OTP for a phone number.
///
/// ## Example JSON
///
/// ```json
/// {
///     "phoneNumber": "+919876543210"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOtpRequest {
    /// E.164 phone number.
    pub phone_number: String,
}

impl SendOtpRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if let Err(msg) = utils::validate_phone_number(&self.phone_number) {
            errors.push(FieldError::new("phoneNumber", &msg));
        }
        finish(errors)
    }
}

/// Log in with a received code.
///
/// ## Example JSON
///
/// ```json
/// {
///     "phoneNumber": "+919876543210",
///     "code": "482913"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub phone_number: String,
    pub code: String,
}

impl VerifyOtpRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if let Err(msg) = utils::validate_phone_number(&self.phone_number) {
            errors.push(FieldError::new("phoneNumber", &msg));
        }
        if self.code.len() != 6 || !self.code.chars().all(|c| c.is_ascii_digit()) {
            errors.push(FieldError::new("code", "Code must be exactly 6 digits"));
        }
        finish(errors)
    }
}

/// Book a time slot.
///
/// ## Example JSON
///
/// ```json
/// {
///     "clubId": 4,
///     "timeSlotId": 112,
///     "specialRequests": "Two extra rackets please"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub club_id: i64,
    pub time_slot_id: i64,
    #[serde(default)]
    pub special_requests: String,
}

impl CreateBookingRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if self.club_id <= 0 {
            errors.push(FieldError::new("clubId", "Must be a positive id"));
        }
        if self.time_slot_id <= 0 {
            errors.push(FieldError::new("timeSlotId", "Must be a positive id"));
        }
        if self.special_requests.chars().count() > MAX_TEXT_LEN {
            errors.push(FieldError::new(
                "specialRequests",
                "Must be at most 500 characters",
            ));
        }
        finish(errors)
    }

    pub fn into_new_booking(self, user_id: Uuid) -> NewBooking {
        NewBooking {
            user_id,
            club_id: self.club_id,
            time_slot_id: self.time_slot_id,
            special_requests: self.special_requests.trim().to_string(),
        }
    }
}

/// Cancel a booking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBookingRequest {
    #[serde(default)]
    pub reason: String,
}

impl CancelBookingRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if self.reason.chars().count() > MAX_TEXT_LEN {
            errors.push(FieldError::new("reason", "Must be at most 500 characters"));
        }
        finish(errors)
    }
}

/// Start paying for a booking.
///
/// ## Example JSON
///
/// ```json
/// {
///     "bookingId": "6f1c...",
///     "paymentMethod": "upi"
/// }
/// ```
///
/// `paymentMethod` is one of `upi`, `stripe_card`, `stripe_wallet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub booking_id: Uuid,
    pub payment_method: String,
}

impl CreatePaymentRequest {
    pub fn validate(&self) -> Result<PaymentMethod, ServiceError> {
        self.payment_method.parse::<PaymentMethod>().map_err(|_| {
            ServiceError::validation(
                "paymentMethod",
                "Must be one of: upi, stripe_card, stripe_wallet",
            )
        })
    }
}

/// Confirm a QR payment with the token embedded in its reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[serde(default)]
    pub security_token: String,
}

impl VerifyPaymentRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if self.security_token.trim().is_empty() {
            errors.push(FieldError::new("securityToken", "Security token is required"));
        } else if self.security_token.len() > 128 {
            errors.push(FieldError::new("securityToken", "Security token is too long"));
        }
        finish(errors)
    }
}

/// Confirm a card payment with a client-side payment method token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    #[serde(default)]
    pub payment_method_token: String,
}

impl ConfirmPaymentRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        if self.payment_method_token.trim().is_empty() {
            errors.push(FieldError::new(
                "paymentMethodToken",
                "Payment method token is required",
            ));
        }
        finish(errors)
    }
}

/// Query for `GET /payments/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusQuery {
    pub transaction_id: String,
}

impl PaymentStatusQuery {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let txn = &self.transaction_id;
        if !txn.starts_with("TXN") || !txn.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ServiceError::validation(
                "transactionId",
                "Not a valid transaction id",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_otp_reports_every_field() {
        let req = VerifyOtpRequest {
            phone_number: "12345".to_string(),
            code: "12ab".to_string(),
        };
        let err = req.validate().unwrap_err();
        let fields: Vec<_> = err
            .field_errors()
            .unwrap()
            .iter()
            .map(|f| f.field.as_str())
            .collect();
        assert_eq!(fields, vec!["phoneNumber", "code"]);
    }

    #[test]
    fn test_booking_request_rejects_bad_ids() {
        let req = CreateBookingRequest {
            club_id: 0,
            time_slot_id: -3,
            special_requests: String::new(),
        };
        assert_eq!(req.validate().unwrap_err().field_errors().unwrap().len(), 2);
    }

    #[test]
    fn test_payment_method_parsing() {
        let mut req = CreatePaymentRequest {
            booking_id: Uuid::new_v4(),
            payment_method: "stripe_card".to_string(),
        };
        assert_eq!(req.validate().unwrap(), PaymentMethod::StripeCard);

        req.payment_method = "cash".to_string();
        assert_eq!(req.validate().unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_security_token_is_mandatory() {
        let req: VerifyPaymentRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.validate().unwrap_err().code(), "VALIDATION_ERROR");
    }
}
