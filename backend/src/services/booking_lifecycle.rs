//! # Booking Lifecycle
//!
//! State transitions over a booking, written as pure functions on values
//! the store has already locked. The store persists whatever these
//! functions changed in the same transaction, so a slot reservation and
//! the booking row that owns it commit or roll back together.
//!
//! ```text
//!            open()
//!              │  (reserve 1 unit)
//!              ▼
//!          ┌────────┐  confirm()   ┌───────────┐  complete()  ┌───────────┐
//!          │pending │─────────────►│ confirmed │─────────────►│ completed │
//!          └────────┘              └───────────┘              └───────────┘
//!            │   │                   │     │
//!   cancel() │   └── mark_no_show() ─┘     │ cancel()
//!  (release) ▼            ▼                ▼ (release)
//!      ┌───────────┐  ┌─────────┐   ┌───────────┐
//!      │ cancelled │  │ no_show │   │ cancelled │
//!      └───────────┘  └─────────┘   └───────────┘
//! ```
//!
//! Every function checks all of its preconditions before touching any
//! field, so a rejected transition leaves the context unchanged.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use crate::db::{
    BookingPaymentStatus, BookingRecord, BookingStatus, PaymentRecord, PaymentStatus,
    TimeSlotRecord,
};

use super::error::ServiceError;
use super::slot_capacity;

/// Validated input for a new booking.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub user_id: Uuid,
    pub club_id: i64,
    pub time_slot_id: i64,
    pub special_requests: String,
}

/// What a successful cancellation left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// A completed payment exists and must be refunded out of band.
    pub refund_due: bool,
}

/// Check that the slot can take this booking at all.
pub fn validate_slot(
    slot: &TimeSlotRecord,
    club_id: i64,
    today: NaiveDate,
) -> Result<(), ServiceError> {
    if slot.club_id != club_id {
        return Err(ServiceError::validation(
            "timeSlotId",
            "Time slot does not belong to this club",
        ));
    }
    if !slot.is_bookable(today) {
        return Err(ServiceError::ResourceConflict(
            "Time slot is no longer available".to_string(),
        ));
    }
    Ok(())
}

/// Reserve capacity on `slot` and build the pending booking.
///
/// `slot` must be the freshly locked row; the caller persists both.
pub fn open(
    slot: &mut TimeSlotRecord,
    request: &NewBooking,
    now: DateTime<Utc>,
) -> Result<BookingRecord, ServiceError> {
    validate_slot(slot, request.club_id, now.date_naive())?;

    slot_capacity::reserve(slot).map_err(|_| {
        ServiceError::ResourceConflict("Time slot is no longer available".to_string())
    })?;

    let booking = BookingRecord {
        id: Uuid::new_v4(),
        user_id: request.user_id,
        club_id: slot.club_id,
        time_slot_id: slot.id,
        booking_date: now,
        status: BookingStatus::Pending,
        payment_status: BookingPaymentStatus::Pending,
        total_amount: slot.effective_price(),
        special_requests: request.special_requests.clone(),
        cancelled_at: None,
        cancellation_reason: String::new(),
        admin_notes: String::new(),
        updated_at: now,
    };

    info!(
        "Booking {} opened on slot {} for user {}",
        booking.id, slot.id, booking.user_id
    );
    Ok(booking)
}

/// Cancel a pending or confirmed booking and release its slot unit.
///
/// Allowed only while `now < slot start - window`. A still-pending payment
/// for the booking is expired so it can no longer be confirmed.
pub fn cancel(
    booking: &mut BookingRecord,
    slot: &mut TimeSlotRecord,
    payment: Option<&mut PaymentRecord>,
    reason: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<CancelOutcome, ServiceError> {
    if !booking.status.holds_capacity() {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is already {}",
            booking.status
        )));
    }
    if now >= slot.start_datetime() - window {
        return Err(ServiceError::CancellationWindowClosed(format!(
            "Bookings can only be cancelled at least {} hours before the slot starts",
            window.num_hours()
        )));
    }

    booking.status = BookingStatus::Cancelled;
    booking.cancelled_at = Some(now);
    booking.cancellation_reason = reason.to_string();
    booking.updated_at = now;
    slot_capacity::release(slot);

    let mut refund_due = false;
    if let Some(payment) = payment {
        match payment.status {
            PaymentStatus::Pending => {
                payment.status = PaymentStatus::Expired;
                payment.append_admin_note(now, "Expired because the booking was cancelled");
            }
            PaymentStatus::Completed => refund_due = true,
            _ => {}
        }
    }

    info!("Booking {} cancelled (refund due: {})", booking.id, refund_due);
    Ok(CancelOutcome { refund_due })
}

/// Payment settled: pending → confirmed.
pub fn confirm(booking: &mut BookingRecord, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if booking.status != BookingStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is {}, only pending bookings can be confirmed",
            booking.status
        )));
    }

    booking.status = BookingStatus::Confirmed;
    booking.payment_status = BookingPaymentStatus::Completed;
    booking.updated_at = now;

    info!("Booking {} confirmed", booking.id);
    Ok(())
}

/// Administrative: the customer never showed up.
///
/// The slot has already started, so no capacity is released.
pub fn mark_no_show(booking: &mut BookingRecord, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if !booking.status.holds_capacity() {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is already {}",
            booking.status
        )));
    }

    booking.status = BookingStatus::NoShow;
    booking.updated_at = now;

    info!("Booking {} marked no-show", booking.id);
    Ok(())
}

/// Administrative: the session took place.
pub fn complete(booking: &mut BookingRecord, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if booking.status != BookingStatus::Confirmed {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is {}, only confirmed bookings can be completed",
            booking.status
        )));
    }

    booking.status = BookingStatus::Completed;
    booking.updated_at = now;

    info!("Booking {} completed", booking.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BookingContext;
    use chrono::{NaiveTime, Timelike};

    fn slot_starting_at(start: DateTime<Utc>, max_capacity: i32) -> TimeSlotRecord {
        TimeSlotRecord {
            id: 3,
            club_id: 1,
            club_name: "Smash Arena".to_string(),
            club_price_per_hour: 60_000,
            date: start.date_naive(),
            start_time: NaiveTime::from_hms_opt(start.hour(), start.minute(), 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            sport: "squash".to_string(),
            max_capacity,
            current_bookings: 0,
            is_available: true,
            price_override: Some(75_000),
        }
    }

    fn request() -> NewBooking {
        NewBooking {
            user_id: Uuid::new_v4(),
            club_id: 1,
            time_slot_id: 3,
            special_requests: "Need rackets".to_string(),
        }
    }

    fn cancel_ctx(
        ctx: &mut BookingContext,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, ServiceError> {
        cancel(
            &mut ctx.booking,
            &mut ctx.slot,
            ctx.payment.as_mut(),
            reason,
            now,
            Duration::hours(2),
        )
    }

    fn base_time() -> DateTime<Utc> {
        "2030-05-01T08:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_open_reserves_and_prices_booking() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::hours(5), 1);

        let booking = open(&mut slot, &request(), now).unwrap();

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.total_amount, 75_000);
        assert_eq!(slot.current_bookings, 1);
        assert!(!slot.is_available);
    }

    #[test]
    fn test_open_rejects_slot_from_another_club() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::hours(5), 1);
        let mut req = request();
        req.club_id = 99;

        let err = open(&mut slot, &req, now).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(slot.current_bookings, 0);
    }

    #[test]
    fn test_open_on_full_slot_is_a_conflict() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::hours(5), 1);
        open(&mut slot, &request(), now).unwrap();

        let err = open(&mut slot, &request(), now).unwrap_err();
        assert!(matches!(err, ServiceError::ResourceConflict(_)));
        assert_eq!(slot.current_bookings, 1);
    }

    #[test]
    fn test_cancel_releases_and_second_cancel_is_rejected() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::hours(3), 1);
        let mut booking = open(&mut slot, &request(), now).unwrap();
        confirm(&mut booking, now).unwrap();
        let mut ctx = BookingContext { booking, slot, payment: None };

        cancel_ctx(&mut ctx, "plans changed", now).unwrap();
        assert_eq!(ctx.booking.status, BookingStatus::Cancelled);
        assert_eq!(ctx.slot.current_bookings, 0);
        assert!(ctx.slot.is_available);

        let before = ctx.clone();
        let err = cancel_ctx(&mut ctx, "again", now).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_cancel_inside_window_is_refused() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::minutes(90), 2);
        let booking = open(&mut slot, &request(), now).unwrap();
        let mut ctx = BookingContext { booking, slot, payment: None };

        let err = cancel_ctx(&mut ctx, "late", now).unwrap_err();
        assert!(matches!(err, ServiceError::CancellationWindowClosed(_)));
        assert_eq!(ctx.slot.current_bookings, 1);
        assert_eq!(ctx.booking.status, BookingStatus::Pending);
    }

    #[test]
    fn test_admin_transitions() {
        let now = base_time();
        let mut slot = slot_starting_at(now + Duration::hours(5), 3);
        let mut booking = open(&mut slot, &request(), now).unwrap();

        assert!(complete(&mut booking, now).is_err());
        confirm(&mut booking, now).unwrap();
        assert!(confirm(&mut booking, now).is_err());
        complete(&mut booking, now).unwrap();
        assert!(mark_no_show(&mut booking, now).is_err());

        let mut other = open(&mut slot, &request(), now).unwrap();
        mark_no_show(&mut other, now).unwrap();
        assert_eq!(other.status, BookingStatus::NoShow);
    }
}
