//! # Payment Manager
//!
//! Orchestrates the payment lifecycle across the store and the gateway.
//!
//! ## Gateway Calls Never Hold Locks
//!
//! ```text
//! create (card)                         confirm (card)
//! ─────────────                         ──────────────
//! read booking (no lock)                read payment (no lock)
//!   pre-check payable                     pre-check owner, method, state
//! gateway.create_intent ◄── network     gateway.confirm_intent ◄── network
//!   transient error → nothing stored      transient / still processing → nothing stored
//! tx: lock, re-check, insert            tx: lock, apply success or failure
//! ```
//!
//! Every decision the pre-check makes is repeated under lock, so a race
//! between the two costs at most a wasted gateway call.
//!
//! ## Webhooks
//!
//! The signature is verified before anything is read. Success and failure
//! events are applied through the same idempotent transitions as the
//! synchronous confirm path, keyed by the gateway intent id, so duplicate
//! or late deliveries change nothing.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{
    BookingStore, PaymentContext, PaymentLookup, PaymentMethod, PaymentRecord, SecurityReport,
};
use crate::utils;

use super::error::ServiceError;
use super::gateway::{
    parse_webhook_event, CardDetails, GatewayError, GatewayEventKind, IntentRequest,
    IntentStatus, PaymentGateway,
};
use super::notifications::{params, templates, Notification, NotificationDispatcher};
use super::payment_lifecycle::{self as lifecycle, GatewayEffect, PaymentPolicy};

/// Payments with at least this many failed attempts count as suspicious.
pub const SUSPICIOUS_ATTEMPTS: i32 = 3;

/// How many locked payments the security report lists.
pub const RECENT_LOCKED_LIMIT: i64 = 10;

/// Read-only view of a payment for its owner.
#[derive(Debug, Clone)]
pub struct PaymentStatusView {
    pub payment: PaymentRecord,
    pub is_expired: bool,
    pub attempts_remaining: i32,
}

/// What a webhook delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Already applied, or the payment is no longer pending.
    Duplicate,
    /// Event type or intent we do not track.
    Ignored,
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher: NotificationDispatcher,
    policy: PaymentPolicy,
}

fn owned_by(ctx: &PaymentContext, user_id: Uuid) -> Result<(), ServiceError> {
    if ctx.booking.user_id != user_id {
        return Err(ServiceError::not_found("Payment"));
    }
    Ok(())
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: NotificationDispatcher,
        policy: PaymentPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            dispatcher,
            policy,
        }
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    // ==========================================
    // CUSTOMER OPERATIONS
    // ==========================================

    /// Start a payment for a pending booking.
    ///
    /// An expired earlier payment is replaced; a live one is reported as
    /// `DuplicateActivePayment`.
    pub async fn create(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        method: PaymentMethod,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();

        let snapshot = self
            .store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Booking"))?;
        lifecycle::check_payable(&snapshot.booking, user_id)?;
        if let Some(existing) = &snapshot.payment {
            lifecycle::check_replaceable(&mut existing.clone(), now)?;
        }

        let mut draft = lifecycle::new_payment(&snapshot.booking, method, &self.policy, now)?;
        if method.is_gateway() {
            let request = IntentRequest {
                amount: draft.amount,
                currency: self.policy.currency.clone(),
                transaction_id: draft.transaction_id.clone(),
                booking_id,
                payment_method: method,
            };
            let intent = self.gateway.create_intent(&request).await.map_err(|e| {
                warn!("Intent creation failed for booking {}: {}", booking_id, e);
                ServiceError::from(e)
            })?;
            lifecycle::attach_intent(&mut draft, intent);
        }

        let ctx = self
            .store
            .insert_payment(
                booking_id,
                Box::new(move |ctx| {
                    lifecycle::check_payable(&ctx.booking, user_id)?;
                    if let Some(existing) = ctx.payment.as_mut() {
                        lifecycle::check_replaceable(existing, now)?;
                    }
                    Ok(draft)
                }),
            )
            .await?;

        info!(
            "Payment {} ({}) created for booking {}: {}",
            ctx.payment.id,
            ctx.payment.payment_method,
            booking_id,
            utils::format_inr(ctx.payment.amount)
        );
        Ok(ctx)
    }

    /// Status lookup by transaction id.
    pub async fn status(
        &self,
        transaction_id: &str,
        user_id: Uuid,
    ) -> Result<PaymentStatusView, ServiceError> {
        let ctx = self
            .store
            .find_payment(&PaymentLookup::TransactionId(transaction_id.to_string()))
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment"))?;
        owned_by(&ctx, user_id)?;

        let now = Utc::now();
        Ok(PaymentStatusView {
            is_expired: ctx.payment.is_expired(now),
            attempts_remaining: lifecycle::attempts_remaining(&ctx.payment, &self.policy.lockout),
            payment: ctx.payment,
        })
    }

    /// Confirm a QR payment with the security token from its reference.
    pub async fn verify(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let policy = self.policy.clone();
        let token = token.to_string();

        let ctx = self
            .store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| {
                    owned_by(ctx, user_id)?;
                    lifecycle::confirm_local(ctx, &token, &policy, now)
                }),
            )
            .await
            .inspect_err(|e| warn!("Payment {} verification rejected: {}", payment_id, e))?;

        self.notify_confirmed(&ctx);
        Ok(ctx)
    }

    /// The payment with its QR image, once the processing checks pass.
    ///
    /// Runs the same checks as [`verify`](Self::verify); a tampered image
    /// is counted as an attempt and never served.
    pub async fn qr_code(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let policy = self.policy.clone();

        self.store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| {
                    owned_by(ctx, user_id)?;
                    lifecycle::check_qr_access(ctx, &policy, now)
                }),
            )
            .await
            .inspect_err(|e| warn!("QR code for payment {} refused: {}", payment_id, e))
    }

    /// Confirm a card payment through the gateway.
    pub async fn confirm(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
        method_token: &str,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let snapshot = self
            .store
            .find_payment(&PaymentLookup::Id(payment_id))
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment"))?;
        owned_by(&snapshot, user_id)?;
        if !snapshot.payment.payment_method.is_gateway() {
            return Err(ServiceError::InvalidTransition(
                "QR payments are confirmed with their security token".to_string(),
            ));
        }
        lifecycle::can_process(&snapshot.payment, now)?;
        let intent_id = snapshot.payment.gateway_intent_id.clone().ok_or_else(|| {
            ServiceError::InvalidTransition("Payment has no gateway intent".to_string())
        })?;

        match self.gateway.confirm_intent(&intent_id, method_token).await {
            Ok(confirmation) => match confirmation.status {
                IntentStatus::Succeeded => {
                    let (ctx, effect) = self
                        .apply_success(PaymentLookup::Id(payment_id), confirmation.card)
                        .await?;
                    if effect == GatewayEffect::Ignored {
                        info!("Payment {} was already settled", payment_id);
                    }
                    Ok(ctx)
                }
                IntentStatus::RequiresPaymentMethod | IntentStatus::Canceled => {
                    let reason = confirmation
                        .failure_message
                        .unwrap_or_else(|| "The payment was declined".to_string());
                    self.apply_failure(PaymentLookup::Id(payment_id), &reason).await?;
                    Err(ServiceError::GatewayDefinitive(reason))
                }
                IntentStatus::Processing
                | IntentStatus::RequiresAction
                | IntentStatus::RequiresConfirmation => {
                    info!(
                        "Intent {} not settled yet ({:?})",
                        intent_id, confirmation.status
                    );
                    Err(ServiceError::GatewayTransient(
                        "The payment is still being processed".to_string(),
                    ))
                }
            },
            Err(GatewayError::Definitive(reason)) => {
                warn!("Gateway declined payment {}: {}", payment_id, reason);
                self.apply_failure(PaymentLookup::Id(payment_id), &reason).await?;
                Err(ServiceError::GatewayDefinitive(reason))
            }
            Err(e) => {
                error!("Gateway error confirming payment {}: {}", payment_id, e);
                Err(e.into())
            }
        }
    }

    /// Customer regeneration of an expired QR payment.
    pub async fn regenerate(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentContext, ServiceError> {
        self.regenerate_as(payment_id, Some(user_id)).await
    }

    /// Refund a completed payment more than the refund window before start.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let policy = self.policy.clone();

        let ctx = self
            .store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| {
                    owned_by(ctx, user_id)?;
                    lifecycle::refund(ctx, &policy, now)
                }),
            )
            .await?;

        self.dispatcher.dispatch(Notification::for_user(
            &ctx.user,
            templates::PAYMENT_REFUNDED,
            params([
                ("transactionId", ctx.payment.transaction_id.clone()),
                ("amount", utils::format_inr(ctx.payment.amount)),
            ]),
        ));
        Ok(ctx)
    }

    /// Abandon a pending payment and cancel its booking.
    pub async fn cancel(
        &self,
        payment_id: Uuid,
        user_id: Uuid,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let policy = self.policy.clone();

        self.store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| {
                    owned_by(ctx, user_id)?;
                    lifecycle::cancel_pending(ctx, &policy, now)
                }),
            )
            .await
    }

    // ==========================================
    // ADMIN OPERATIONS
    // ==========================================

    pub async fn admin_regenerate(&self, payment_id: Uuid) -> Result<PaymentContext, ServiceError> {
        self.regenerate_as(payment_id, None).await
    }

    pub async fn unlock(&self, payment_id: Uuid) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        self.store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| lifecycle::unlock(ctx, now)),
            )
            .await
    }

    pub async fn security_report(&self) -> Result<SecurityReport, ServiceError> {
        Ok(self
            .store
            .security_report(SUSPICIOUS_ATTEMPTS, RECENT_LOCKED_LIMIT)
            .await?)
    }

    /// `user_id` of `None` means an administrator.
    async fn regenerate_as(
        &self,
        payment_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<PaymentContext, ServiceError> {
        let now = Utc::now();
        let policy = self.policy.clone();

        self.store
            .update_payment(
                PaymentLookup::Id(payment_id),
                Box::new(move |ctx| {
                    if let Some(user_id) = user_id {
                        owned_by(ctx, user_id)?;
                    }
                    lifecycle::regenerate(ctx, user_id.is_none(), &policy, now)
                }),
            )
            .await
    }

    // ==========================================
    // WEBHOOK
    // ==========================================

    /// Verify and apply a gateway webhook delivery.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, ServiceError> {
        if !self.gateway.verify_webhook_signature(payload, signature, now) {
            warn!("Rejected webhook with invalid signature");
            return Err(ServiceError::InvalidSignature);
        }

        let event = parse_webhook_event(payload)?;
        let intent_id = match (&event.kind, event.intent_id) {
            (GatewayEventKind::Other(kind), _) => {
                info!("Ignoring webhook event {} ({})", event.event_id, kind);
                return Ok(WebhookOutcome::Ignored);
            }
            (_, None) => {
                warn!("Webhook event {} has no payment intent", event.event_id);
                return Ok(WebhookOutcome::Ignored);
            }
            (_, Some(intent_id)) => intent_id,
        };

        let lookup = PaymentLookup::GatewayIntent(intent_id.clone());
        let result = match &event.kind {
            GatewayEventKind::Succeeded => self.apply_success(lookup, None).await,
            GatewayEventKind::Failed(reason) => self.apply_failure(lookup, reason).await,
            GatewayEventKind::Other(_) => return Ok(WebhookOutcome::Ignored),
        };

        match result {
            Ok((_, GatewayEffect::Applied | GatewayEffect::RefundDue)) => {
                info!("Webhook {} applied to intent {}", event.event_id, intent_id);
                Ok(WebhookOutcome::Applied)
            }
            Ok((_, GatewayEffect::Ignored)) => {
                info!("Webhook {} was a duplicate for intent {}", event.event_id, intent_id);
                Ok(WebhookOutcome::Duplicate)
            }
            Err(ServiceError::NotFound(_)) => {
                warn!("Webhook {} references unknown intent {}", event.event_id, intent_id);
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    // ==========================================
    // SHARED TRANSITIONS
    // ==========================================

    async fn apply_success(
        &self,
        lookup: PaymentLookup,
        card: Option<CardDetails>,
    ) -> Result<(PaymentContext, GatewayEffect), ServiceError> {
        let now = Utc::now();
        let outcome = Arc::new(OnceLock::new());
        let slot = outcome.clone();

        let ctx = self
            .store
            .update_payment(
                lookup,
                Box::new(move |ctx| {
                    let _ = slot.set(lifecycle::confirm_via_gateway(ctx, card.as_ref(), now));
                    Ok(())
                }),
            )
            .await?;

        let effect = outcome.get().copied().unwrap_or(GatewayEffect::Ignored);
        match effect {
            GatewayEffect::Applied => self.notify_confirmed(&ctx),
            GatewayEffect::RefundDue => {
                warn!("Refund requested for late charge on payment {}", ctx.payment.id);
                self.dispatcher.dispatch(Notification::for_user(
                    &ctx.user,
                    templates::REFUND_REQUESTED,
                    params([
                        ("bookingId", ctx.booking.id.to_string()),
                        ("transactionId", ctx.payment.transaction_id.clone()),
                        ("amount", utils::format_inr(ctx.payment.amount)),
                    ]),
                ));
            }
            GatewayEffect::Ignored => {}
        }
        Ok((ctx, effect))
    }

    async fn apply_failure(
        &self,
        lookup: PaymentLookup,
        reason: &str,
    ) -> Result<(PaymentContext, GatewayEffect), ServiceError> {
        let now = Utc::now();
        let reason = reason.to_string();
        let outcome = Arc::new(OnceLock::new());
        let slot = outcome.clone();

        let ctx = self
            .store
            .update_payment(
                lookup,
                Box::new(move |ctx| {
                    let _ = slot.set(lifecycle::fail_via_gateway(ctx, &reason, now));
                    Ok(())
                }),
            )
            .await?;

        Ok((ctx, outcome.get().copied().unwrap_or(GatewayEffect::Ignored)))
    }

    fn notify_confirmed(&self, ctx: &PaymentContext) {
        self.dispatcher.dispatch(Notification::sms(
            &ctx.user.phone_number,
            templates::BOOKING_CONFIRMED,
            params([
                ("bookingId", ctx.booking.id.to_string()),
                ("club", ctx.slot.club_name.clone()),
                ("date", ctx.slot.date.to_string()),
                ("startTime", ctx.slot.start_time.format("%H:%M").to_string()),
            ]),
        ));
        self.dispatcher.dispatch(Notification::for_user(
            &ctx.user,
            templates::PAYMENT_CONFIRMED,
            params([
                ("transactionId", ctx.payment.transaction_id.clone()),
                ("amount", utils::format_inr(ctx.payment.amount)),
            ]),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{
        BookingRecord, BookingStatus, MemoryStore, PaymentStatus, TimeSlotRecord, UserRecord,
    };
    use crate::services::booking_lifecycle::{self, NewBooking};
    use crate::services::gateway::{sign_webhook_payload, MockGateway};
    use chrono::{Duration, NaiveTime, Timelike};

    const SECRET: &str = "whsec_test";

    struct Fixture {
        store: MemoryStore,
        gateway: Arc<MockGateway>,
        service: PaymentService,
        user: UserRecord,
        slot: TimeSlotRecord,
    }

    async fn fixture(slot_starts_in: Duration) -> Fixture {
        let store = MemoryStore::new();
        let club = store.add_club("Ace Courts", 80_000).await;
        let start = Utc::now() + slot_starts_in;
        let start_time = NaiveTime::from_hms_opt(start.hour(), start.minute(), 0).unwrap();
        let slot = store
            .add_slot(club, start.date_naive(), start_time, start_time, "tennis", 4, None)
            .await
            .unwrap();
        let user = UserRecord::new("+919811111111", Utc::now());
        store.add_user(user.clone()).await;

        let gateway = Arc::new(MockGateway::new(SECRET));
        let (dispatcher, _rx) = NotificationDispatcher::new(64);
        let policy = PaymentPolicy::from_config(&AppConfig::default());
        let service =
            PaymentService::new(Arc::new(store.clone()), gateway.clone(), dispatcher, policy);

        Fixture {
            store,
            gateway,
            service,
            user,
            slot,
        }
    }

    async fn booking(f: &Fixture) -> BookingRecord {
        let request = NewBooking {
            user_id: f.user.id,
            club_id: f.slot.club_id,
            time_slot_id: f.slot.id,
            special_requests: String::new(),
        };
        let (booking, _) = f
            .store
            .create_booking(
                f.slot.id,
                Box::new(move |slot| booking_lifecycle::open(slot, &request, Utc::now())),
            )
            .await
            .unwrap();
        booking
    }

    fn succeeded_event(intent_id: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": intent_id } }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_qr_payment_confirms_booking() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;

        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();
        assert!(created.payment.qr_payload.is_some());

        let ctx = f
            .service
            .verify(created.payment.id, f.user.id, &created.payment.security_token)
            .await
            .unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Completed);
        assert_eq!(ctx.booking.status, BookingStatus::Confirmed);
        // Occupancy is owned by the booking, not the payment.
        assert_eq!(ctx.slot.current_bookings, 1);
    }

    #[tokio::test]
    async fn test_wrong_tokens_lock_payment_until_admin_unlock() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();
        let id = created.payment.id;

        for _ in 0..4 {
            let err = f.service.verify(id, f.user.id, "wrong").await.unwrap_err();
            assert!(matches!(err, ServiceError::TokenMismatch));
        }
        let err = f.service.verify(id, f.user.id, "wrong").await.unwrap_err();
        assert!(matches!(err, ServiceError::TokenMismatch));

        let err = f
            .service
            .verify(id, f.user.id, &created.payment.security_token)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SecurityLockout(_)));

        let report = f.service.security_report().await.unwrap();
        assert_eq!(report.locked_payments, 1);
        assert_eq!(report.recent_locked[0].id, id);

        f.service.unlock(id).await.unwrap();
        let ctx = f
            .service
            .verify(id, f.user.id, &created.payment.security_token)
            .await
            .unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_qr_code_counts_tampered_image_as_attempt() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();
        let id = created.payment.id;

        let served = f.service.qr_code(id, f.user.id).await.unwrap();
        assert_eq!(served.payment.qr_image, created.payment.qr_image);
        assert_eq!(served.payment.attempts, 0);

        let stranger = Uuid::new_v4();
        let err = f.service.qr_code(id, stranger).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        f.store
            .update_payment(
                PaymentLookup::Id(id),
                Box::new(|ctx| {
                    if let Some(image) = ctx.payment.qr_image.as_mut() {
                        image.push(0);
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = f.service.qr_code(id, f.user.id).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::PaymentBlocked(lifecycle::BlockReason::IntegrityMismatch)
        ));
        let stored = f
            .store
            .find_payment(&PaymentLookup::Id(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payment.attempts, 1);
    }

    #[tokio::test]
    async fn test_card_payment_has_no_qr_code() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();

        let err = f.service.qr_code(created.payment.id, f.user.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_payment_for_booking_is_duplicate() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        f.service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();

        let err = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateActivePayment { .. }));
    }

    #[tokio::test]
    async fn test_card_confirm_via_gateway() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();
        assert!(created.payment.gateway_intent_id.is_some());

        let ctx = f
            .service
            .confirm(created.payment.id, f.user.id, "pm_card_visa")
            .await
            .unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Completed);
        assert_eq!(ctx.payment.card_last_four.as_deref(), Some("4242"));
        assert_eq!(ctx.booking.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_transient_gateway_error_changes_nothing() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();
        let before = f
            .store
            .find_payment(&PaymentLookup::Id(created.payment.id))
            .await
            .unwrap()
            .unwrap();

        for token in ["pm_card_unavailable", "pm_card_processing"] {
            let err = f
                .service
                .confirm(created.payment.id, f.user.id, token)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::GatewayTransient(_)));
        }

        let after = f
            .store
            .find_payment(&PaymentLookup::Id(created.payment.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_definitive_decline_fails_payment() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();

        let err = f
            .service
            .confirm(created.payment.id, f.user.id, "pm_card_chargeDeclined")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::GatewayDefinitive(_)));

        let ctx = f
            .store
            .find_payment(&PaymentLookup::Id(created.payment.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Failed);
        assert_eq!(ctx.booking.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_webhook_applies_once() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();
        let intent = created.payment.gateway_intent_id.clone().unwrap();
        let calls_before = f.gateway.calls();

        let now = Utc::now();
        let payload = succeeded_event(&intent);
        let signature = sign_webhook_payload(&payload, SECRET, now.timestamp());

        let first = f.service.handle_webhook(&payload, &signature, now).await.unwrap();
        let second = f.service.handle_webhook(&payload, &signature, now).await.unwrap();
        assert_eq!(first, WebhookOutcome::Applied);
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(f.gateway.calls(), calls_before);

        let ctx = f.service.status(&created.payment.transaction_id, f.user.id).await.unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Completed);
        let booking_ctx = f.store.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(booking_ctx.booking.status, BookingStatus::Confirmed);
        assert_eq!(booking_ctx.slot.current_bookings, 1);
    }

    #[tokio::test]
    async fn test_webhook_success_after_no_show_is_acknowledged() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::StripeCard)
            .await
            .unwrap();
        let intent = created.payment.gateway_intent_id.clone().unwrap();
        f.store
            .update_booking(
                booking.id,
                Box::new(|ctx| booking_lifecycle::mark_no_show(&mut ctx.booking, Utc::now())),
            )
            .await
            .unwrap();

        let now = Utc::now();
        let payload = succeeded_event(&intent);
        let signature = sign_webhook_payload(&payload, SECRET, now.timestamp());

        let first = f.service.handle_webhook(&payload, &signature, now).await.unwrap();
        let second = f.service.handle_webhook(&payload, &signature, now).await.unwrap();
        assert_eq!(first, WebhookOutcome::Applied);
        assert_eq!(second, WebhookOutcome::Duplicate);

        let ctx = f
            .store
            .find_payment(&PaymentLookup::Id(created.payment.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Completed);
        assert!(ctx.payment.admin_notes.contains("refund required"));
        assert_eq!(ctx.booking.status, BookingStatus::NoShow);
    }

    #[tokio::test]
    async fn test_webhook_with_bad_signature_is_rejected() {
        let f = fixture(Duration::days(2)).await;
        let now = Utc::now();
        let payload = succeeded_event("pi_unknown");
        let signature = sign_webhook_payload(&payload, "whsec_other", now.timestamp());

        let err = f
            .service
            .handle_webhook(&payload, &signature, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_refund_releases_slot() {
        let f = fixture(Duration::days(3)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();
        f.service
            .verify(created.payment.id, f.user.id, &created.payment.security_token)
            .await
            .unwrap();

        let ctx = f.service.refund(created.payment.id, f.user.id).await.unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Refunded);
        assert_eq!(ctx.booking.status, BookingStatus::Cancelled);
        assert_eq!(ctx.slot.current_bookings, 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_payment_cancels_booking() {
        let f = fixture(Duration::days(2)).await;
        let booking = booking(&f).await;
        let created = f
            .service
            .create(booking.id, f.user.id, PaymentMethod::Upi)
            .await
            .unwrap();

        let ctx = f.service.cancel(created.payment.id, f.user.id).await.unwrap();
        assert_eq!(ctx.payment.status, PaymentStatus::Failed);
        assert_eq!(ctx.booking.status, BookingStatus::Cancelled);
        assert_eq!(ctx.slot.current_bookings, 0);
    }
}
