//! # Booking Manager
//!
//! Customer and admin operations on bookings. Each method runs exactly
//! one store transaction built from `booking_lifecycle` transitions and
//! dispatches notifications only after that transaction has committed.
//!
//! ## Operations
//!
//! | Operation | Who | Effect on slot |
//! |-----------|-----|----------------|
//! | `create` | owner | reserve 1 |
//! | `cancel` | owner | release 1 |
//! | `mark_no_show` | admin | none |
//! | `complete` | admin | none |

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::db::{BookingContext, BookingRecord, BookingStore, PaymentStatus, TimeSlotRecord};
use crate::utils;

use super::booking_lifecycle::{self, NewBooking};
use super::error::ServiceError;
use super::notifications::{params, templates, Notification, NotificationDispatcher};

/// Result of a customer cancellation.
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub context: BookingContext,
    /// The booking was paid; a refund request has been queued.
    pub refund_due: bool,
}

#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn BookingStore>,
    dispatcher: NotificationDispatcher,
    cancellation_window: Duration,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        dispatcher: NotificationDispatcher,
        cancellation_window: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            cancellation_window,
        }
    }

    /// Reserve a unit of the slot and open a pending booking.
    pub async fn create(
        &self,
        request: NewBooking,
    ) -> Result<(BookingRecord, TimeSlotRecord), ServiceError> {
        let now = Utc::now();
        let slot_id = request.time_slot_id;

        let (booking, slot) = self
            .store
            .create_booking(
                slot_id,
                Box::new(move |slot| booking_lifecycle::open(slot, &request, now)),
            )
            .await?;

        info!(
            "Booking {} created: slot {} now {}/{}",
            booking.id, slot.id, slot.current_bookings, slot.max_capacity
        );
        Ok((booking, slot))
    }

    /// A booking as seen by its owner.
    pub async fn get(&self, booking_id: Uuid, user_id: Uuid) -> Result<BookingContext, ServiceError> {
        match self.store.get_booking(booking_id).await? {
            Some(ctx) if ctx.booking.user_id == user_id => Ok(ctx),
            _ => Err(ServiceError::not_found("Booking")),
        }
    }

    /// Cancel a booking outside the cancellation window.
    pub async fn cancel(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        reason: &str,
    ) -> Result<Cancellation, ServiceError> {
        let now = Utc::now();
        let window = self.cancellation_window;
        let reason = reason.to_string();

        let ctx = self
            .store
            .update_booking(
                booking_id,
                Box::new(move |ctx| {
                    if ctx.booking.user_id != user_id {
                        return Err(ServiceError::not_found("Booking"));
                    }
                    booking_lifecycle::cancel(
                        &mut ctx.booking,
                        &mut ctx.slot,
                        ctx.payment.as_mut(),
                        &reason,
                        now,
                        window,
                    )
                    .map(|_| ())
                }),
            )
            .await?;

        let refund_due = ctx
            .payment
            .as_ref()
            .is_some_and(|p| p.status == PaymentStatus::Completed);
        if let (true, Some(payment)) = (refund_due, &ctx.payment) {
            info!("Refund requested for payment {}", payment.id);
            if let Some(user) = self.store.get_user(user_id).await? {
                self.dispatcher.dispatch(Notification::for_user(
                    &user,
                    templates::REFUND_REQUESTED,
                    params([
                        ("bookingId", booking_id.to_string()),
                        ("transactionId", payment.transaction_id.clone()),
                        ("amount", utils::format_inr(payment.amount)),
                    ]),
                ));
            }
        }

        Ok(Cancellation {
            context: ctx,
            refund_due,
        })
    }

    /// Admin: the customer did not turn up.
    pub async fn mark_no_show(&self, booking_id: Uuid) -> Result<BookingContext, ServiceError> {
        let now = Utc::now();
        self.store
            .update_booking(
                booking_id,
                Box::new(move |ctx| booking_lifecycle::mark_no_show(&mut ctx.booking, now)),
            )
            .await
    }

    /// Admin: the session took place.
    pub async fn complete(&self, booking_id: Uuid) -> Result<BookingContext, ServiceError> {
        let now = Utc::now();
        self.store
            .update_booking(
                booking_id,
                Box::new(move |ctx| booking_lifecycle::complete(&mut ctx.booking, now)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, UserRecord};
    use chrono::{DateTime, Timelike};

    struct Fixture {
        store: MemoryStore,
        service: BookingService,
        club_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let club_id = store.add_club("Smash Arena", 60_000).await;
        let (dispatcher, _rx) = NotificationDispatcher::new(16);
        let service = BookingService::new(Arc::new(store.clone()), dispatcher, Duration::hours(2));
        Fixture {
            store,
            service,
            club_id,
        }
    }

    async fn slot_at(f: &Fixture, start: DateTime<Utc>, max_capacity: i32) -> TimeSlotRecord {
        let start_time = chrono::NaiveTime::from_hms_opt(start.hour(), start.minute(), 0).unwrap();
        f.store
            .add_slot(
                f.club_id,
                start.date_naive(),
                start_time,
                start_time,
                "badminton",
                max_capacity,
                None,
            )
            .await
            .unwrap()
    }

    async fn user(f: &Fixture, phone: &str) -> UserRecord {
        let user = UserRecord::new(phone, Utc::now());
        f.store.add_user(user.clone()).await;
        user
    }

    fn request(slot: &TimeSlotRecord, user: &UserRecord) -> NewBooking {
        NewBooking {
            user_id: user.id,
            club_id: slot.club_id,
            time_slot_id: slot.id,
            special_requests: String::new(),
        }
    }

    #[tokio::test]
    async fn test_two_users_fill_slot_and_third_conflicts() {
        let f = fixture().await;
        let slot = slot_at(&f, Utc::now() + Duration::days(2), 2).await;
        let alice = user(&f, "+919800000001").await;
        let bob = user(&f, "+919800000002").await;
        let carol = user(&f, "+919800000003").await;

        f.service.create(request(&slot, &alice)).await.unwrap();
        let (_, after) = f.service.create(request(&slot, &bob)).await.unwrap();
        assert_eq!(after.current_bookings, 2);
        assert!(!after.is_available);

        let err = f.service.create(request(&slot, &carol)).await.unwrap_err();
        assert!(matches!(err, ServiceError::ResourceConflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_confirmed_booking_once() {
        let f = fixture().await;
        let slot = slot_at(&f, Utc::now() + Duration::hours(3), 1).await;
        let owner = user(&f, "+919800000004").await;

        let (booking, _) = f.service.create(request(&slot, &owner)).await.unwrap();
        f.store
            .update_booking(
                booking.id,
                Box::new(|ctx| booking_lifecycle::confirm(&mut ctx.booking, Utc::now())),
            )
            .await
            .unwrap();

        let cancelled = f.service.cancel(booking.id, owner.id, "rain").await.unwrap();
        assert!(!cancelled.refund_due);
        assert_eq!(cancelled.context.slot.current_bookings, 0);
        assert!(cancelled.context.slot.is_available);

        let err = f.service.cancel(booking.id, owner.id, "rain").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
        let slot_after = f.store.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(slot_after.current_bookings, 0);
    }

    #[tokio::test]
    async fn test_other_users_cannot_see_or_cancel() {
        let f = fixture().await;
        let slot = slot_at(&f, Utc::now() + Duration::days(1), 2).await;
        let owner = user(&f, "+919800000005").await;
        let stranger = user(&f, "+919800000006").await;
        let (booking, _) = f.service.create(request(&slot, &owner)).await.unwrap();

        assert!(f.service.get(booking.id, owner.id).await.is_ok());
        let err = f.service.get(booking.id, stranger.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = f.service.cancel(booking.id, stranger.id, "x").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let ctx = f.service.get(booking.id, owner.id).await.unwrap();
        assert_eq!(ctx.slot.current_bookings, 1);
    }

    #[tokio::test]
    async fn test_admin_no_show_keeps_capacity() {
        let f = fixture().await;
        let slot = slot_at(&f, Utc::now() + Duration::days(1), 2).await;
        let owner = user(&f, "+919800000007").await;
        let (booking, _) = f.service.create(request(&slot, &owner)).await.unwrap();

        let ctx = f.service.mark_no_show(booking.id).await.unwrap();
        assert_eq!(ctx.booking.status, crate::db::BookingStatus::NoShow);
        assert_eq!(ctx.slot.current_bookings, 1);

        let err = f.service.complete(booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
    }
}
