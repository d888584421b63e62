//! # Service Errors
//!
//! The error taxonomy shared by every booking, payment and login operation.
//! Each variant has a stable machine-readable code (`code()`) and a
//! human-readable message (`Display`). Storage failures carry internal
//! detail for the logs only; `public_message()` replaces it before anything
//! reaches a client.
//!
//! | Code | Meaning |
//! |------|---------|
//! | `VALIDATION_ERROR` | Malformed input, with per-field messages |
//! | `RESOURCE_CONFLICT` | Slot no longer available |
//! | `RATE_LIMITED` | Too many OTP requests |
//! | `CANCELLATION_WINDOW_CLOSED` | Too close to slot start |
//! | `DUPLICATE_ACTIVE_PAYMENT` | Booking already has a live payment |
//! | `SECURITY_LOCKOUT` | Attempts exhausted, admin action required |
//! | `TOKEN_MISMATCH` | Wrong security token (attempt recorded) |
//! | `PAYMENT_EXPIRED` / `PAYMENT_NOT_PENDING` / `INTEGRITY_CHECK_FAILED` | Payment cannot be processed |
//! | `GATEWAY_UNAVAILABLE` | Retryable gateway failure, nothing changed |
//! | `PAYMENT_DECLINED` | Gateway refused, payment failed |
//! | `NOT_FOUND` | Missing entity |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;

use super::gateway::GatewayError;
use super::payment_lifecycle::BlockReason;

/// One offending input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid input: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("{0}")]
    ResourceConflict(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    CancellationWindowClosed(String),

    #[error("Booking already has an active payment {payment_id} (expires {expires_at})")]
    DuplicateActivePayment {
        payment_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[error("{0}")]
    SecurityLockout(String),

    #[error("Invalid security token")]
    TokenMismatch,

    #[error("{0}")]
    PaymentBlocked(BlockReason),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Expired(String),

    #[error("{0}")]
    TooManyAttempts(String),

    #[error("Payment gateway temporarily unavailable: {0}")]
    GatewayTransient(String),

    #[error("Payment declined: {0}")]
    GatewayDefinitive(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("{0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Rendering failure: {0}")]
    Rendering(String),
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ServiceError {
    /// Single-field validation failure.
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{} not found", what))
    }

    /// Stable error kind for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ResourceConflict(_) => "RESOURCE_CONFLICT",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::CancellationWindowClosed(_) => "CANCELLATION_WINDOW_CLOSED",
            Self::DuplicateActivePayment { .. } => "DUPLICATE_ACTIVE_PAYMENT",
            Self::SecurityLockout(_) => "SECURITY_LOCKOUT",
            Self::TokenMismatch => "TOKEN_MISMATCH",
            Self::PaymentBlocked(reason) => reason.code(),
            Self::InvalidTransition(_) => "INVALID_STATE",
            Self::Expired(_) => "EXPIRED",
            Self::TooManyAttempts(_) => "TOO_MANY_ATTEMPTS",
            Self::GatewayTransient(_) => "GATEWAY_UNAVAILABLE",
            Self::GatewayDefinitive(_) => "PAYMENT_DECLINED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) | Self::Rendering(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show a client.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) | Self::Rendering(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Per-field details for validation failures.
    pub fn field_errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::Validation(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<BlockReason> for ServiceError {
    fn from(reason: BlockReason) -> Self {
        match reason {
            BlockReason::Locked => Self::SecurityLockout(reason.to_string()),
            other => Self::PaymentBlocked(other),
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => Self::GatewayTransient(msg),
            GatewayError::Definitive(msg) => Self::GatewayDefinitive(msg),
            GatewayError::InvalidSignature => Self::InvalidSignature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_every_field() {
        let err = ServiceError::Validation(vec![
            FieldError::new("slotId", "must be positive"),
            FieldError::new("clubId", "must be positive"),
        ]);
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(
            err.to_string(),
            "Invalid input: slotId: must be positive; clubId: must be positive"
        );
        assert_eq!(err.field_errors().map(|f| f.len()), Some(2));
    }

    #[test]
    fn test_storage_detail_is_hidden() {
        let err = ServiceError::from(DatabaseError::ConnectionError(
            "password authentication failed for user booking".to_string(),
        ));
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!err.public_message().contains("password"));
    }

    #[test]
    fn test_lock_reason_maps_to_security_lockout() {
        let err = ServiceError::from(BlockReason::Locked);
        assert_eq!(err.code(), "SECURITY_LOCKOUT");

        let err = ServiceError::from(BlockReason::Expired);
        assert_eq!(err.code(), "PAYMENT_EXPIRED");
        assert_eq!(err.to_string(), "Payment has expired");
    }
}
