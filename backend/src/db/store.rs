//! # Booking Store
//!
//! The transactional boundary of the system. Every method on
//! [`BookingStore`] is a single atomic unit:
//!
//! ```text
//!   BEGIN
//!     lock rows            booking → slot → payment   (always this order)
//!     apply transition     pure function from services/, on owned copies
//!     write back           only records that differ from what was read
//!   COMMIT
//!   return verdict         Ok(context) or the transition's error
//! ```
//!
//! A rejected transition is rolled back to the locked snapshot. Payment and
//! login transitions then commit only their [`SecurityState`]: attempt
//! counters and lock flags, which is how lockouts survive a failed request.
//! Every other rejection commits nothing.
//!
//! Transitions are passed as boxed `FnOnce` closures so the trait stays
//! object safe and handlers can share one `Arc<dyn BookingStore>`.
//!
//! ## Lock Ordering
//!
//! | Operation              | Locks (in order)                              |
//! |------------------------|-----------------------------------------------|
//! | `create_booking`       | slot                                          |
//! | `update_booking`       | booking, slot, payment                        |
//! | `insert_payment`       | booking, slot, payment                        |
//! | `update_payment`       | booking, slot, payment                        |
//! | `issue_otp`            | phone (advisory)                              |
//! | `verify_otp`           | phone (advisory), otp, user                   |
//! | `update_user`          | user                                          |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::{queries, Database, DatabaseError};
use crate::services::ServiceError;

// ============================================
// TRANSITION TYPES
// ============================================

/// Reserve capacity on the locked slot and produce the new booking.
pub type BookingBuilder =
    Box<dyn FnOnce(&mut TimeSlotRecord) -> Result<BookingRecord, ServiceError> + Send>;

/// Mutate a locked booking (and its slot and payment).
pub type BookingTransition =
    Box<dyn FnOnce(&mut BookingContext) -> Result<(), ServiceError> + Send>;

/// Produce the booking's new payment. The existing payment, if any, is in
/// the context and is replaced when the builder succeeds.
pub type PaymentBuilder =
    Box<dyn FnOnce(&mut BookingContext) -> Result<PaymentRecord, ServiceError> + Send>;

/// Mutate a locked payment and its booking and slot.
pub type PaymentTransition =
    Box<dyn FnOnce(&mut PaymentContext) -> Result<(), ServiceError> + Send>;

/// Given the number of codes requested in the rate window, build the next one.
pub type OtpBuilder = Box<dyn FnOnce(i64) -> Result<OtpRecord, ServiceError> + Send>;

/// Check a code against the newest OTP and update the account.
pub type OtpTransition = Box<dyn FnOnce(&mut LoginContext) -> Result<(), ServiceError> + Send>;

pub type UserTransition = Box<dyn FnOnce(&mut UserRecord) -> Result<(), ServiceError> + Send>;

/// The identifiers a payment can be addressed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLookup {
    Id(Uuid),
    TransactionId(String),
    GatewayIntent(String),
}

impl PaymentLookup {
    pub fn matches(&self, payment: &PaymentRecord) -> bool {
        match self {
            PaymentLookup::Id(id) => payment.id == *id,
            PaymentLookup::TransactionId(txn) => payment.transaction_id == *txn,
            PaymentLookup::GatewayIntent(intent) => {
                payment.gateway_intent_id.as_deref() == Some(intent.as_str())
            }
        }
    }
}

/// Persistence for slots, bookings, payments, users and OTPs.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), DatabaseError>;

    async fn get_slot(&self, slot_id: i64) -> Result<Option<TimeSlotRecord>, DatabaseError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DatabaseError>;

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, DatabaseError>;

    /// Unlocked snapshot of a booking with its slot and payment.
    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<BookingContext>, DatabaseError>;

    /// Unlocked snapshot of a payment with its booking, slot and user.
    async fn find_payment(
        &self,
        lookup: &PaymentLookup,
    ) -> Result<Option<PaymentContext>, DatabaseError>;

    async fn security_report(
        &self,
        suspicious_attempts: i32,
        recent_limit: i64,
    ) -> Result<SecurityReport, DatabaseError>;

    /// Lock the slot, build the booking, persist both.
    async fn create_booking(
        &self,
        slot_id: i64,
        build: BookingBuilder,
    ) -> Result<(BookingRecord, TimeSlotRecord), ServiceError>;

    async fn update_booking(
        &self,
        booking_id: Uuid,
        apply: BookingTransition,
    ) -> Result<BookingContext, ServiceError>;

    async fn insert_payment(
        &self,
        booking_id: Uuid,
        build: PaymentBuilder,
    ) -> Result<PaymentContext, ServiceError>;

    async fn update_payment(
        &self,
        lookup: PaymentLookup,
        apply: PaymentTransition,
    ) -> Result<PaymentContext, ServiceError>;

    /// Drop the phone's log entries up to `window_start`, count the rest,
    /// build, log the request and replace all earlier codes for the phone.
    async fn issue_otp(
        &self,
        phone: &str,
        window_start: DateTime<Utc>,
        build: OtpBuilder,
    ) -> Result<OtpRecord, ServiceError>;

    async fn verify_otp(
        &self,
        phone: &str,
        apply: OtpTransition,
    ) -> Result<LoginContext, ServiceError>;

    async fn update_user(
        &self,
        phone: &str,
        apply: UserTransition,
    ) -> Result<UserRecord, ServiceError>;

    /// Expire every pending payment whose deadline is before `cutoff`.
    async fn expire_stale_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;
}

// ============================================
// POSTGRES IMPLEMENTATION
// ============================================

/// `BookingStore` over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, DatabaseError> {
        self.db
            .pool()
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))
    }
}

/// Lock booking, slot and payment in that order.
async fn lock_booking_context(
    tx: &tokio_postgres::Transaction<'_>,
    booking_id: Uuid,
) -> Result<Option<BookingContext>, DatabaseError> {
    let booking = match queries::get_booking(tx, booking_id, true).await? {
        Some(booking) => booking,
        None => return Ok(None),
    };
    let slot = queries::get_slot(tx, booking.time_slot_id, true)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("slot {}", booking.time_slot_id)))?;
    let payment = queries::get_payment_for_booking(tx, booking_id, true).await?;

    Ok(Some(BookingContext { booking, slot, payment }))
}

/// Write back booking and slot if the transition changed them.
async fn persist_booking_and_slot(
    tx: &tokio_postgres::Transaction<'_>,
    before: (&BookingRecord, &TimeSlotRecord),
    after: (&BookingRecord, &TimeSlotRecord),
) -> Result<(), DatabaseError> {
    if before.0 != after.0 {
        queries::update_booking(tx, after.0).await?;
    }
    if before.1 != after.1 {
        queries::update_slot_occupancy(tx, after.1).await?;
    }
    Ok(())
}

async fn load_payment_context<C: tokio_postgres::GenericClient + Sync>(
    client: &C,
    payment: PaymentRecord,
) -> Result<Option<PaymentContext>, DatabaseError> {
    let Some(booking) = queries::get_booking(client, payment.booking_id, false).await? else {
        return Ok(None);
    };
    let Some(slot) = queries::get_slot(client, booking.time_slot_id, false).await? else {
        return Ok(None);
    };
    let Some(user) = queries::get_user(client, booking.user_id).await? else {
        return Ok(None);
    };
    Ok(Some(PaymentContext { payment, booking, slot, user }))
}

#[async_trait]
impl BookingStore for PgStore {
    async fn health_check(&self) -> Result<(), DatabaseError> {
        let client = self.client().await?;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn get_slot(&self, slot_id: i64) -> Result<Option<TimeSlotRecord>, DatabaseError> {
        let client = self.client().await?;
        queries::get_slot(&**client, slot_id, false).await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let client = self.client().await?;
        queries::get_user(&**client, user_id).await
    }

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let client = self.client().await?;
        queries::get_user_by_phone(&**client, phone, false).await
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<BookingContext>, DatabaseError> {
        let client = self.client().await?;
        let Some(booking) = queries::get_booking(&**client, booking_id, false).await? else {
            return Ok(None);
        };
        let slot = queries::get_slot(&**client, booking.time_slot_id, false)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("slot {}", booking.time_slot_id)))?;
        let payment = queries::get_payment_for_booking(&**client, booking_id, false).await?;
        Ok(Some(BookingContext { booking, slot, payment }))
    }

    async fn find_payment(
        &self,
        lookup: &PaymentLookup,
    ) -> Result<Option<PaymentContext>, DatabaseError> {
        let client = self.client().await?;
        match queries::find_payment(&**client, lookup).await? {
            Some(payment) => load_payment_context(&**client, payment).await,
            None => Ok(None),
        }
    }

    async fn security_report(
        &self,
        suspicious_attempts: i32,
        recent_limit: i64,
    ) -> Result<SecurityReport, DatabaseError> {
        let client = self.client().await?;
        Ok(SecurityReport {
            locked_payments: queries::count_locked_payments(&**client).await?,
            suspicious_payments: queries::count_suspicious_payments(&**client, suspicious_attempts)
                .await?,
            recent_locked: queries::recent_locked_payments(&**client, recent_limit).await?,
        })
    }

    async fn create_booking(
        &self,
        slot_id: i64,
        build: BookingBuilder,
    ) -> Result<(BookingRecord, TimeSlotRecord), ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut slot = queries::get_slot(&*tx, slot_id, true)
            .await?
            .ok_or_else(|| ServiceError::validation("timeSlotId", "Time slot does not exist"))?;
        let original = slot.clone();

        // Dropping an uncommitted transaction rolls it back.
        let booking = build(&mut slot)?;
        if slot != original {
            queries::update_slot_occupancy(&*tx, &slot).await?;
        }
        queries::insert_booking(&*tx, &booking).await?;
        tx.commit().await.map_err(DatabaseError::from)?;

        debug!("create_booking on slot {} committed", slot_id);
        Ok((booking, slot))
    }

    async fn update_booking(
        &self,
        booking_id: Uuid,
        apply: BookingTransition,
    ) -> Result<BookingContext, ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut ctx = lock_booking_context(&tx, booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Booking"))?;
        let original = ctx.clone();

        apply(&mut ctx)?;
        persist_booking_and_slot(
            &tx,
            (&original.booking, &original.slot),
            (&ctx.booking, &ctx.slot),
        )
        .await?;
        if let Some(payment) = &ctx.payment {
            if original.payment.as_ref() != Some(payment) {
                queries::update_payment(&*tx, payment).await?;
            }
        }
        tx.commit().await.map_err(DatabaseError::from)?;

        Ok(ctx)
    }

    async fn insert_payment(
        &self,
        booking_id: Uuid,
        build: PaymentBuilder,
    ) -> Result<PaymentContext, ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut ctx = lock_booking_context(&tx, booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Booking"))?;
        let original = ctx.clone();

        let payment = build(&mut ctx)?;
        persist_booking_and_slot(
            &tx,
            (&original.booking, &original.slot),
            (&ctx.booking, &ctx.slot),
        )
        .await?;
        if let Some(existing) = &ctx.payment {
            info!("Replacing payment {} for booking {}", existing.id, booking_id);
            queries::delete_payment(&*tx, existing.id).await?;
        }
        queries::insert_payment(&*tx, &payment).await?;

        let user = queries::get_user(&*tx, ctx.booking.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User"))?;
        tx.commit().await.map_err(DatabaseError::from)?;

        Ok(PaymentContext {
            payment,
            booking: ctx.booking,
            slot: ctx.slot,
            user,
        })
    }

    async fn update_payment(
        &self,
        lookup: PaymentLookup,
        apply: PaymentTransition,
    ) -> Result<PaymentContext, ServiceError> {
        let mut client = self.client().await?;

        // Resolve the owning booking first so locks are taken in booking order.
        let found = queries::find_payment(&**client, &lookup)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment"))?;

        let tx = client.transaction().await.map_err(DatabaseError::from)?;
        let locked = lock_booking_context(&tx, found.booking_id).await?;
        let Some(BookingContext { booking, slot, payment: Some(payment) }) = locked else {
            return Err(ServiceError::not_found("Payment"));
        };
        if payment.id != found.id {
            // Replaced between the lookup and the lock.
            warn!("Payment {} was replaced before it could be locked", found.id);
            return Err(ServiceError::not_found("Payment"));
        }
        let user = queries::get_user(&*tx, booking.user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User"))?;

        let mut ctx = PaymentContext { payment, booking, slot, user };
        let original = ctx.clone();

        let verdict = apply(&mut ctx);
        let kept = match &verdict {
            Ok(()) => ctx,
            Err(_) => original.rejected(&ctx),
        };
        if kept.payment != original.payment {
            queries::update_payment(&*tx, &kept.payment).await?;
        }
        persist_booking_and_slot(
            &tx,
            (&original.booking, &original.slot),
            (&kept.booking, &kept.slot),
        )
        .await?;
        tx.commit().await.map_err(DatabaseError::from)?;

        verdict.map(|_| kept)
    }

    async fn issue_otp(
        &self,
        phone: &str,
        window_start: DateTime<Utc>,
        build: OtpBuilder,
    ) -> Result<OtpRecord, ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        queries::lock_phone(&*tx, phone).await?;
        queries::delete_otp_requests_before(&*tx, phone, window_start).await?;
        let recent = queries::count_otp_requests_since(&*tx, phone, window_start).await?;

        let otp = build(recent)?;
        queries::insert_otp_request(&*tx, phone, otp.created_at).await?;
        let purged = queries::delete_otps_for_phone(&*tx, phone).await?;
        let stored = queries::insert_otp(&*tx, &otp).await?;
        tx.commit().await.map_err(DatabaseError::from)?;

        debug!("Issued OTP {} ({} earlier codes purged)", stored.id, purged);
        Ok(stored)
    }

    async fn verify_otp(
        &self,
        phone: &str,
        apply: OtpTransition,
    ) -> Result<LoginContext, ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        queries::lock_phone(&*tx, phone).await?;
        let mut ctx = LoginContext {
            phone_number: phone.to_string(),
            otp: queries::newest_unverified_otp(&*tx, phone, true).await?,
            user: queries::get_user_by_phone(&*tx, phone, true).await?,
        };
        let original = ctx.clone();

        let verdict = apply(&mut ctx);
        let kept = match &verdict {
            Ok(()) => ctx,
            Err(_) => original.rejected(&ctx),
        };
        if let Some(otp) = &kept.otp {
            if original.otp.as_ref() != Some(otp) {
                queries::update_otp(&*tx, otp).await?;
            }
        }
        match (&original.user, &kept.user) {
            (None, Some(user)) => queries::insert_user(&*tx, user).await?,
            (Some(before), Some(after)) if before != after => {
                queries::update_user(&*tx, after).await?
            }
            _ => {}
        }
        tx.commit().await.map_err(DatabaseError::from)?;

        verdict.map(|_| kept)
    }

    async fn update_user(
        &self,
        phone: &str,
        apply: UserTransition,
    ) -> Result<UserRecord, ServiceError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut user = queries::get_user_by_phone(&*tx, phone, true)
            .await?
            .ok_or_else(|| ServiceError::not_found("User"))?;
        let original = user.clone();

        apply(&mut user)?;
        if user != original {
            queries::update_user(&*tx, &user).await?;
        }
        tx.commit().await.map_err(DatabaseError::from)?;

        Ok(user)
    }

    async fn expire_stale_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let client = self.client().await?;
        let note = format!("[{}] Expired by sweeper", now.format("%Y-%m-%d %H:%M:%S"));
        queries::expire_stale_payments(&**client, cutoff, &note).await
    }
}
