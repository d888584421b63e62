//! # Expiry Sweeper
//!
//! Background task that moves stale `pending` payments to `expired`.
//!
//! Expiry is enforced lazily by `can_process` on every confirmation; the
//! sweeper only tidies up payments nobody came back for. It waits a grace
//! period past each deadline and never touches slot occupancy, which is
//! owned by the booking.
//!
//! ```text
//! ExpirySweeper (background task)
//!              │
//!              └── Every PAYMENT_SWEEP_INTERVAL_SECS:
//!                    pending ∧ expires_at < now - grace  →  expired
//! ```

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::{BookingStore, DatabaseError};

#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn BookingStore>,
    period: StdDuration,
    grace: Duration,
}

impl ExpirySweeper {
    /// ## Arguments
    ///
    /// * `period` - Time between sweeps
    /// * `grace` - How long past its deadline a payment is left alone
    pub fn new(store: Arc<dyn BookingStore>, period: StdDuration, grace: Duration) -> Self {
        Self {
            store,
            period,
            grace,
        }
    }

    /// Run forever. Spawn with `tokio::spawn`.
    pub async fn start(&self) {
        info!(
            "Starting expiry sweeper (every {}s, grace {}s)",
            self.period.as_secs(),
            self.grace.num_seconds()
        );

        let mut ticker = interval(self.period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!("Payment expiry sweep failed: {}", e);
            }
        }
    }

    /// One pass. Returns the ids of the payments that were expired.
    pub async fn sweep_once(&self) -> Result<Vec<Uuid>, DatabaseError> {
        let now = Utc::now();
        let expired = self
            .store
            .expire_stale_payments(now - self.grace, now)
            .await?;

        if expired.is_empty() {
            debug!("Expiry sweep found nothing to do");
        } else {
            info!("Expired {} stale payments", expired.len());
            for id in &expired {
                debug!("  payment {} -> expired", id);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{MemoryStore, PaymentLookup, PaymentMethod, PaymentStatus, UserRecord};
    use crate::services::booking_lifecycle::{self, NewBooking};
    use crate::services::payment_lifecycle::{self, PaymentPolicy};
    use chrono::{NaiveDate, NaiveTime};

    async fn pending_payment(store: &MemoryStore, expires_in: Duration) -> Uuid {
        let club = store.add_club("Net Zone", 40_000).await;
        let slot = store
            .add_slot(
                club,
                NaiveDate::from_ymd_opt(2035, 6, 1).unwrap(),
                NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                "cricket",
                2,
                None,
            )
            .await
            .unwrap();
        let user = UserRecord::new("+919822222222", Utc::now());
        store.add_user(user.clone()).await;

        let request = NewBooking {
            user_id: user.id,
            club_id: club,
            time_slot_id: slot.id,
            special_requests: String::new(),
        };
        let (booking, _) = store
            .create_booking(
                slot.id,
                Box::new(move |slot| booking_lifecycle::open(slot, &request, Utc::now())),
            )
            .await
            .unwrap();

        let policy = PaymentPolicy::from_config(&AppConfig::default());
        let ctx = store
            .insert_payment(
                booking.id,
                Box::new(move |ctx| {
                    let now = Utc::now();
                    let mut payment =
                        payment_lifecycle::new_payment(&ctx.booking, PaymentMethod::Upi, &policy, now)?;
                    payment.expires_at = now + expires_in;
                    Ok(payment)
                }),
            )
            .await
            .unwrap();
        ctx.payment.id
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_period() {
        let store = MemoryStore::new();
        let recent = pending_payment(&store, Duration::minutes(-5)).await;
        let stale = pending_payment(&store, Duration::hours(-2)).await;

        let sweeper = ExpirySweeper::new(
            Arc::new(store.clone()),
            StdDuration::from_secs(60),
            Duration::hours(1),
        );
        let expired = sweeper.sweep_once().await.unwrap();
        assert_eq!(expired, vec![stale]);

        let status = |id| {
            let store = store.clone();
            async move {
                store
                    .find_payment(&PaymentLookup::Id(id))
                    .await
                    .unwrap()
                    .unwrap()
                    .payment
                    .status
            }
        };
        assert_eq!(status(stale).await, PaymentStatus::Expired);
        assert_eq!(status(recent).await, PaymentStatus::Pending);
    }
}
