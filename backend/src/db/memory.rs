//! # In-Memory Store
//!
//! A `BookingStore` that keeps every table in process memory behind one
//! `tokio::sync::Mutex`. Holding the mutex for the whole method gives the
//! same serializability a row-locking Postgres transaction gives, which
//! makes it suitable for tests and for running the API without a database.
//!
//! Transitions are applied to cloned records and written back afterwards,
//! exactly as `PgStore` does, so a rejected transition keeps the same
//! security counters and drops everything else in both implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use super::DatabaseError;
use crate::services::{payment_lifecycle, ServiceError};

#[derive(Debug, Clone)]
struct Club {
    name: String,
    price_per_hour: i64,
}

#[derive(Default)]
struct Tables {
    clubs: HashMap<i64, Club>,
    slots: HashMap<i64, TimeSlotRecord>,
    users: HashMap<Uuid, UserRecord>,
    otps: Vec<OtpRecord>,
    /// Request times per phone, pruned to the rate window on every send.
    otp_requests: HashMap<String, Vec<DateTime<Utc>>>,
    bookings: HashMap<Uuid, BookingRecord>,
    payments: HashMap<Uuid, PaymentRecord>,
    next_club_id: i64,
    next_slot_id: i64,
    next_otp_seq: i64,
}

impl Tables {
    fn payment_for_booking(&self, booking_id: Uuid) -> Option<&PaymentRecord> {
        self.payments.values().find(|p| p.booking_id == booking_id)
    }

    fn booking_context(&self, booking_id: Uuid) -> Option<BookingContext> {
        let booking = self.bookings.get(&booking_id)?.clone();
        let slot = self.slots.get(&booking.time_slot_id)?.clone();
        let payment = self.payment_for_booking(booking_id).cloned();
        Some(BookingContext { booking, slot, payment })
    }

    fn payment_context(&self, lookup: &PaymentLookup) -> Option<PaymentContext> {
        let payment = self.payments.values().find(|p| lookup.matches(p))?.clone();
        let booking = self.bookings.get(&payment.booking_id)?.clone();
        let slot = self.slots.get(&booking.time_slot_id)?.clone();
        let user = self.users.get(&booking.user_id)?.clone();
        Some(PaymentContext { payment, booking, slot, user })
    }

    fn user_by_phone(&self, phone: &str) -> Option<&UserRecord> {
        self.users.values().find(|u| u.phone_number == phone)
    }

    fn save_booking_and_slot(&mut self, booking: &BookingRecord, slot: &TimeSlotRecord) {
        self.bookings.insert(booking.id, booking.clone());
        self.slots.insert(slot.id, slot.clone());
    }
}

/// Process-local `BookingStore`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================
    // SEEDING
    // ============================================

    /// Register a club and return its id.
    pub async fn add_club(&self, name: &str, price_per_hour: i64) -> i64 {
        let mut tables = self.tables.lock().await;
        tables.next_club_id += 1;
        let id = tables.next_club_id;
        tables.clubs.insert(
            id,
            Club {
                name: name.to_string(),
                price_per_hour,
            },
        );
        id
    }

    /// Add an available slot to a club and return it.
    pub async fn add_slot(
        &self,
        club_id: i64,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        sport: &str,
        max_capacity: i32,
        price_override: Option<i64>,
    ) -> Result<TimeSlotRecord, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let club = tables
            .clubs
            .get(&club_id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("club {}", club_id)))?;
        if max_capacity < 1 {
            return Err(DatabaseError::InvalidData(
                "max_capacity must be at least 1".to_string(),
            ));
        }

        tables.next_slot_id += 1;
        let slot = TimeSlotRecord {
            id: tables.next_slot_id,
            club_id,
            club_name: club.name,
            club_price_per_hour: club.price_per_hour,
            date,
            start_time,
            end_time,
            sport: sport.to_string(),
            max_capacity,
            current_bookings: 0,
            is_available: true,
            price_override,
        };
        tables.slots.insert(slot.id, slot.clone());
        Ok(slot)
    }

    /// A demo club with hourly badminton slots for the next three days,
    /// so a database-less server has something to book.
    pub async fn seed_demo(&self, today: NaiveDate) -> Result<usize, DatabaseError> {
        let club = self.add_club("Demo Sports Club", 60_000).await;
        let mut created = 0;

        for day in 0..3 {
            let date = today + Duration::days(day);
            for hour in 6..22 {
                let start = NaiveTime::from_hms_opt(hour, 0, 0)
                    .ok_or_else(|| DatabaseError::InvalidData(format!("hour {}", hour)))?;
                let end = start + Duration::hours(1);
                self.add_slot(club, date, start, end, "badminton", 2, None).await?;
                created += 1;
            }
        }

        debug!("Seeded {} demo slots for club {}", created, club);
        Ok(created)
    }

    /// Insert a user directly, bypassing OTP login.
    #[cfg(test)]
    pub async fn add_user(&self, user: UserRecord) {
        self.tables.lock().await.users.insert(user.id, user);
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn get_slot(&self, slot_id: i64) -> Result<Option<TimeSlotRecord>, DatabaseError> {
        Ok(self.tables.lock().await.slots.get(&slot_id).cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, DatabaseError> {
        Ok(self.tables.lock().await.user_by_phone(phone).cloned())
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<BookingContext>, DatabaseError> {
        Ok(self.tables.lock().await.booking_context(booking_id))
    }

    async fn find_payment(
        &self,
        lookup: &PaymentLookup,
    ) -> Result<Option<PaymentContext>, DatabaseError> {
        Ok(self.tables.lock().await.payment_context(lookup))
    }

    async fn security_report(
        &self,
        suspicious_attempts: i32,
        recent_limit: i64,
    ) -> Result<SecurityReport, DatabaseError> {
        let tables = self.tables.lock().await;

        let mut recent_locked: Vec<PaymentRecord> =
            tables.payments.values().filter(|p| p.is_locked).cloned().collect();
        recent_locked.sort_by_key(|p| std::cmp::Reverse(p.last_attempt_at.unwrap_or(p.created_at)));
        let locked_payments = recent_locked.len() as i64;
        recent_locked.truncate(recent_limit.max(0) as usize);

        let suspicious_payments = tables
            .payments
            .values()
            .filter(|p| !p.is_locked && p.attempts >= suspicious_attempts)
            .count() as i64;

        Ok(SecurityReport {
            locked_payments,
            suspicious_payments,
            recent_locked,
        })
    }

    async fn create_booking(
        &self,
        slot_id: i64,
        build: BookingBuilder,
    ) -> Result<(BookingRecord, TimeSlotRecord), ServiceError> {
        let mut tables = self.tables.lock().await;

        let mut slot = tables
            .slots
            .get(&slot_id)
            .cloned()
            .ok_or_else(|| ServiceError::validation("timeSlotId", "Time slot does not exist"))?;

        let booking = build(&mut slot)?;
        tables.slots.insert(slot.id, slot.clone());
        tables.bookings.insert(booking.id, booking.clone());

        debug!("Booking {} stored in memory", booking.id);
        Ok((booking, slot))
    }

    async fn update_booking(
        &self,
        booking_id: Uuid,
        apply: BookingTransition,
    ) -> Result<BookingContext, ServiceError> {
        let mut tables = self.tables.lock().await;

        let mut ctx = tables
            .booking_context(booking_id)
            .ok_or_else(|| ServiceError::not_found("Booking"))?;

        apply(&mut ctx)?;
        tables.save_booking_and_slot(&ctx.booking, &ctx.slot);
        if let Some(payment) = &ctx.payment {
            tables.payments.insert(payment.id, payment.clone());
        }
        Ok(ctx)
    }

    async fn insert_payment(
        &self,
        booking_id: Uuid,
        build: PaymentBuilder,
    ) -> Result<PaymentContext, ServiceError> {
        let mut tables = self.tables.lock().await;

        let mut ctx = tables
            .booking_context(booking_id)
            .ok_or_else(|| ServiceError::not_found("Booking"))?;

        let payment = build(&mut ctx)?;
        let user = tables
            .users
            .get(&ctx.booking.user_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("User"))?;

        tables.save_booking_and_slot(&ctx.booking, &ctx.slot);
        if let Some(existing) = &ctx.payment {
            tables.payments.remove(&existing.id);
        }
        tables.payments.insert(payment.id, payment.clone());

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
        let mut tables = self.tables.lock().await;

        let mut ctx = tables
            .payment_context(&lookup)
            .ok_or_else(|| ServiceError::not_found("Payment"))?;

        let original = ctx.clone();
        let verdict = apply(&mut ctx);
        let kept = match &verdict {
            Ok(()) => ctx,
            Err(_) => original.rejected(&ctx),
        };
        tables.payments.insert(kept.payment.id, kept.payment.clone());
        tables.save_booking_and_slot(&kept.booking, &kept.slot);
        verdict.map(|_| kept)
    }

    async fn issue_otp(
        &self,
        phone: &str,
        window_start: DateTime<Utc>,
        build: OtpBuilder,
    ) -> Result<OtpRecord, ServiceError> {
        let mut tables = self.tables.lock().await;

        let recent = {
            let log = tables.otp_requests.entry(phone.to_string()).or_default();
            log.retain(|at| *at > window_start);
            log.len() as i64
        };

        let mut otp = build(recent)?;
        tables.next_otp_seq += 1;
        otp.seq = tables.next_otp_seq;

        tables
            .otp_requests
            .entry(phone.to_string())
            .or_default()
            .push(otp.created_at);
        tables.otps.retain(|o| o.phone_number != phone);
        tables.otps.push(otp.clone());
        Ok(otp)
    }

    async fn verify_otp(
        &self,
        phone: &str,
        apply: OtpTransition,
    ) -> Result<LoginContext, ServiceError> {
        let mut tables = self.tables.lock().await;

        let otp = tables
            .otps
            .iter()
            .filter(|o| o.phone_number == phone && !o.is_verified)
            .max_by_key(|o| (o.created_at, o.seq))
            .cloned();
        let mut ctx = LoginContext {
            phone_number: phone.to_string(),
            otp,
            user: tables.user_by_phone(phone).cloned(),
        };

        let original = ctx.clone();
        let verdict = apply(&mut ctx);
        let kept = match &verdict {
            Ok(()) => ctx,
            Err(_) => original.rejected(&ctx),
        };
        if let Some(otp) = &kept.otp {
            if let Some(stored) = tables.otps.iter_mut().find(|o| o.id == otp.id) {
                *stored = otp.clone();
            }
        }
        if let Some(user) = &kept.user {
            tables.users.insert(user.id, user.clone());
        }
        verdict.map(|_| kept)
    }

    async fn update_user(
        &self,
        phone: &str,
        apply: UserTransition,
    ) -> Result<UserRecord, ServiceError> {
        let mut tables = self.tables.lock().await;

        let mut user = tables
            .user_by_phone(phone)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("User"))?;

        apply(&mut user)?;
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn expire_stale_payments(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .payments
            .values_mut()
            .filter_map(|p| payment_lifecycle::expire_if_stale(p, cutoff, now).then_some(p.id))
            .collect())
    }
}
