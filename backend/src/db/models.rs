//! # Database Models
//!
//! This module defines the data structures that map to database tables.
//! Each struct represents a row in a table; status columns are parsed into
//! typed enums at the row boundary so no string comparison leaks into the
//! lifecycle code.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `clubs` | Facilities and their hourly price |
//! | `time_slots` | Bookable (club, date, start, sport) units with capacity |
//! | `users` | Phone-identified accounts with login lockout counters |
//! | `otps` | One-time login codes |
//! | `otp_requests` | Issuance log backing the OTP rate limit |
//! | `bookings` | A user's claim on a slot |
//! | `payments` | One settlement attempt per booking |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌──────────┐       ┌──────────────┐       ┌──────────────┐
//! │  clubs   │──────<│  time_slots  │──────<│   bookings   │
//! │          │       │              │       │              │
//! │ id (PK)  │       │ id, club_id  │       │ slot, club   │
//! │ price    │       │ capacity     │       │ status       │
//! └──────────┘       └──────────────┘       └──────────────┘
//!                                              │       │
//!                                  ┌───────────┘       └──────────┐
//!                                  ▼                              ▼
//!                           ┌──────────────┐               ┌──────────────┐
//!                           │    users     │               │   payments   │
//!                           │              │               │ (1:1 booking)│
//!                           │ phone (UQ)   │               │ token, hash  │
//!                           │ lock flag    │               │ attempts     │
//!                           └──────────────┘               └──────────────┘
//! ```
//!
//! ## Note on Money
//!
//! All amounts are `i64` minor units (paise). `utils::format_inr` renders
//! them for humans.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// STATUS ENUMS
// ============================================

/// Implements `as_str`, `Display` and `FromStr` for a status enum whose
/// variants map one-to-one onto the lowercase strings stored in Postgres.
macro_rules! db_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The string stored in the database column.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

/// Booking lifecycle state.
///
/// ```text
/// pending ──► confirmed ──► completed
///    │            │
///    ├────────────┴──► cancelled
///    └────────────┴──► no_show
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

db_enum!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
    NoShow => "no_show",
});

impl BookingStatus {
    /// Terminal states accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::NoShow)
    }

    /// States that still hold a unit of slot capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

/// The booking's mirror of its payment's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

db_enum!(BookingPaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

/// Payment lifecycle state.
///
/// ```text
/// pending ──► completed ──► refunded
///    ├──────► failed
///    └──────► expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Expired,
    Refunded,
}

db_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Expired => "expired",
    Refunded => "refunded",
});

/// How a payment is settled.
///
/// `Upi` renders a local QR payment reference that is integrity-checked on
/// every confirmation. The `Stripe*` methods delegate to the external gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Upi,
    StripeCard,
    StripeWallet,
}

db_enum!(PaymentMethod {
    Upi => "upi",
    StripeCard => "stripe_card",
    StripeWallet => "stripe_wallet",
});

impl PaymentMethod {
    /// Every method, in the order clients list them.
    pub const ALL: [PaymentMethod; 3] = [Self::Upi, Self::StripeCard, Self::StripeWallet];

    /// True when settlement happens at the external gateway.
    pub fn is_gateway(&self) -> bool {
        !matches!(self, Self::Upi)
    }
}

// ============================================
// RECORDS
// ============================================

/// A bookable slot, joined with the owning club's name and base price.
///
/// ## Fields
///
/// | Field | Type | Description |
/// |-------|------|-------------|
/// | max_capacity | i32 | Concurrent bookings allowed |
/// | current_bookings | i32 | Bookings currently holding capacity |
/// | is_available | bool | Cleared when the slot fills up |
/// | price_override | Option<i64> | Replaces the club price when set |
///
/// Occupancy fields are only ever changed by `services::slot_capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlotRecord {
    pub id: i64,
    pub club_id: i64,
    pub club_name: String,
    pub club_price_per_hour: i64,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub sport: String,
    pub max_capacity: i32,
    pub current_bookings: i32,
    pub is_available: bool,
    pub price_override: Option<i64>,
}

impl TimeSlotRecord {
    /// Price charged for one booking of this slot.
    pub fn effective_price(&self) -> i64 {
        self.price_override.unwrap_or(self.club_price_per_hour)
    }

    /// Slot start as an absolute instant. Slot dates and times are stored in UTC.
    pub fn start_datetime(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::new(self.date, self.start_time))
    }

    pub fn has_free_capacity(&self) -> bool {
        self.current_bookings < self.max_capacity
    }

    /// `available ∧ free capacity ∧ date ≥ today`.
    pub fn is_bookable(&self, today: NaiveDate) -> bool {
        self.is_available && self.has_free_capacity() && self.date >= today
    }
}

/// A phone-identified account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub phone_number: String,
    pub email: Option<String>,
    pub is_phone_verified: bool,
    pub failed_login_attempts: i32,
    pub last_failed_login: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub date_joined: DateTime<Utc>,
}

impl UserRecord {
    /// A fresh, unverified account for a phone seen for the first time.
    pub fn new(phone_number: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            email: None,
            is_phone_verified: false,
            failed_login_attempts: 0,
            last_failed_login: None,
            is_locked: false,
            date_joined: now,
        }
    }
}

/// A one-time login code.
///
/// `seq` is the insertion order and breaks ties between codes created in
/// the same instant: the newest code is the one with the greatest
/// `(created_at, seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub id: Uuid,
    pub seq: i64,
    pub phone_number: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub is_verified: bool,
    pub attempts: i32,
}

/// A user's claim on a time slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub club_id: i64,
    pub time_slot_id: i64,
    pub booking_date: DateTime<Utc>,
    pub status: BookingStatus,
    pub payment_status: BookingPaymentStatus,
    /// Copied from the slot's effective price at creation; never changes.
    pub total_amount: i64,
    pub special_requests: String,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: String,
    pub admin_notes: String,
    pub updated_at: DateTime<Utc>,
}

/// One settlement attempt for a booking.
///
/// ## Security Fields
///
/// | Field | Description |
/// |-------|-------------|
/// | security_token | Opaque token the payer must echo back on local confirmation |
/// | qr_payload | The UPI payment reference (local methods only) |
/// | qr_image | PNG QR code encoding `qr_payload` |
/// | qr_code_hash | SHA-256 of `qr_image` taken at render time |
/// | attempts | Failed confirmation attempts |
/// | is_locked | Set once `attempts` reaches the lockout threshold |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub amount: i64,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub security_token: String,
    pub qr_payload: Option<String>,
    #[serde(skip)]
    pub qr_image: Option<Vec<u8>>,
    pub qr_code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub upi_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub admin_notes: String,
    pub created_by_admin: bool,
    pub gateway_intent_id: Option<String>,
    pub gateway_client_secret: Option<String>,
    pub card_last_four: Option<String>,
    pub card_brand: Option<String>,
}

impl PaymentRecord {
    /// Soft deadline check; strictly after `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Append a timestamped line to the admin notes.
    pub fn append_admin_note(&mut self, now: DateTime<Utc>, note: &str) {
        if !self.admin_notes.is_empty() {
            self.admin_notes.push('\n');
        }
        self.admin_notes
            .push_str(&format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S"), note));
    }
}

/// Aggregate figures for the admin security report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub locked_payments: i64,
    /// Unlocked payments with three or more failed attempts.
    pub suspicious_payments: i64,
    /// The ten most recent locked payments, newest first.
    pub recent_locked: Vec<PaymentRecord>,
}

/// A booking with its slot and (at most one) payment, as locked by a
/// booking transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingContext {
    pub booking: BookingRecord,
    pub slot: TimeSlotRecord,
    pub payment: Option<PaymentRecord>,
}

/// Payment plus the booking, slot and user it belongs to.
///
/// The user is read for authorization and notifications only; payment
/// transactions never write it.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentContext {
    pub payment: PaymentRecord,
    pub booking: BookingRecord,
    pub slot: TimeSlotRecord,
    pub user: UserRecord,
}

/// The newest unverified OTP for a phone and the phone's account, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginContext {
    pub phone_number: String,
    pub otp: Option<OtpRecord>,
    pub user: Option<UserRecord>,
}

// ============================================
// REJECTED TRANSITIONS
// ============================================

/// Lockout bookkeeping that survives a rejected transition.
///
/// A store rolls a rejected transition back to the locked snapshot and then
/// carries over only these fields from the attempted state:
///
/// | Record | Kept on rejection |
/// |--------|-------------------|
/// | payment | `attempts`, `last_attempt_at`; on a new lock also `is_locked`, `status`, `admin_notes` |
/// | booking | `payment_status`, `updated_at` when its payment was just locked |
/// | otp | `attempts` |
/// | user | `failed_login_attempts`, `last_failed_login`, `is_locked` |
pub trait SecurityState: Clone {
    fn retain_security_state(&mut self, attempted: &Self);

    /// `self` is the snapshot taken before the transition ran.
    fn rejected(&self, attempted: &Self) -> Self {
        let mut kept = self.clone();
        kept.retain_security_state(attempted);
        kept
    }
}

impl SecurityState for PaymentRecord {
    fn retain_security_state(&mut self, attempted: &Self) {
        self.attempts = attempted.attempts;
        self.last_attempt_at = attempted.last_attempt_at;
        if attempted.is_locked && !self.is_locked {
            self.is_locked = true;
            self.status = attempted.status;
            self.admin_notes = attempted.admin_notes.clone();
        }
    }
}

impl SecurityState for OtpRecord {
    fn retain_security_state(&mut self, attempted: &Self) {
        self.attempts = attempted.attempts;
    }
}

impl SecurityState for UserRecord {
    fn retain_security_state(&mut self, attempted: &Self) {
        self.failed_login_attempts = attempted.failed_login_attempts;
        self.last_failed_login = attempted.last_failed_login;
        self.is_locked = attempted.is_locked;
    }
}

impl SecurityState for PaymentContext {
    fn retain_security_state(&mut self, attempted: &Self) {
        let newly_locked = attempted.payment.is_locked && !self.payment.is_locked;
        self.payment.retain_security_state(&attempted.payment);
        if newly_locked {
            self.booking.payment_status = attempted.booking.payment_status;
            self.booking.updated_at = attempted.booking.updated_at;
        }
    }
}

impl SecurityState for LoginContext {
    /// Accounts are never created by a rejected login.
    fn retain_security_state(&mut self, attempted: &Self) {
        if let (Some(otp), Some(tried)) = (self.otp.as_mut(), attempted.otp.as_ref()) {
            otp.retain_security_state(tried);
        }
        if let (Some(user), Some(tried)) = (self.user.as_mut(), attempted.user.as_ref()) {
            user.retain_security_state(tried);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> TimeSlotRecord {
        TimeSlotRecord {
            id: 1,
            club_id: 7,
            club_name: "Racquet Club".to_string(),
            club_price_per_hour: 80_000,
            date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            start_time: NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(19, 30, 0).unwrap(),
            sport: "badminton".to_string(),
            max_capacity: 2,
            current_bookings: 0,
            is_available: true,
            price_override: None,
        }
    }

    #[test]
    fn test_status_round_trips_through_column_text() {
        assert_eq!("no_show".parse::<BookingStatus>(), Ok(BookingStatus::NoShow));
        assert_eq!(PaymentMethod::StripeWallet.as_str(), "stripe_wallet");
        assert!("settled".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_effective_price_prefers_override() {
        let mut s = slot();
        assert_eq!(s.effective_price(), 80_000);
        s.price_override = Some(120_000);
        assert_eq!(s.effective_price(), 120_000);
    }

    #[test]
    fn test_is_bookable() {
        let s = slot();
        let today = s.date;
        assert!(s.is_bookable(today));
        assert!(!s.is_bookable(today.succ_opt().unwrap()));

        let mut full = slot();
        full.current_bookings = 2;
        assert!(!full.is_bookable(today));

        let mut closed = slot();
        closed.is_available = false;
        assert!(!closed.is_bookable(today));
    }

    #[test]
    fn test_start_datetime_is_utc() {
        let s = slot();
        assert_eq!(s.start_datetime().to_rfc3339(), "2026-03-14T18:30:00+00:00");
    }

    #[test]
    fn test_terminal_states() {
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::NoShow.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(PaymentMethod::StripeCard.is_gateway());
        assert!(!PaymentMethod::Upi.is_gateway());
    }
}
