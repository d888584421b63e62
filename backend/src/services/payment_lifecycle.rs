//! # Payment Lifecycle
//!
//! State transitions over a payment and its linked booking, written as pure
//! functions over values the store has locked. Security side effects
//! (attempt counters, locks) are applied to the same values, and the store
//! persists them even when the transition itself is rejected.
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!   new_payment ─►│                  pending                   │
//!                 └────────────────────────────────────────────┘
//!                   │ confirm_*        │ 5th failure  │ deadline  │ cancel_pending
//!                   ▼                  ▼              ▼           ▼
//!              ┌───────────┐     ┌──────────┐   ┌─────────┐  ┌────────┐
//!              │ completed │     │  failed  │   │ expired │  │ failed │
//!              └───────────┘     │ (locked) │   └─────────┘  └────────┘
//!                   │ refund     └──────────┘        │
//!                   ▼                 │ unlock       │ regenerate
//!              ┌───────────┐          └──► pending ◄─┘
//!              │ refunded  │
//!              └───────────┘
//! ```
//!
//! ## Processing Checks
//!
//! `can_process` applies these checks in a fixed order and reports the
//! first one that fails:
//!
//! | # | Check | Reason |
//! |---|-------|--------|
//! | 1 | `is_locked` | "Payment is locked due to security violations" |
//! | 2 | `now > expires_at` | "Payment has expired" |
//! | 3 | `status != pending` | "Payment status is {status}" |
//! | 4 | QR image hash mismatch (UPI only) | "QR code integrity check failed" |
//!
//! Fetching the QR image and confirming with the security token both run
//! these checks, and both count an integrity failure as a failed attempt.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{
    BookingPaymentStatus, BookingRecord, BookingStatus, PaymentContext, PaymentMethod,
    PaymentRecord, PaymentStatus,
};
use crate::utils;

use super::booking_lifecycle;
use super::error::ServiceError;
use super::gateway::{CardDetails, PaymentIntent};
use super::lockout::{LockoutDecision, LockoutPolicy};

/// Why a payment cannot be processed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Locked,
    Expired,
    NotPending(PaymentStatus),
    IntegrityMismatch,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Locked => "SECURITY_LOCKOUT",
            Self::Expired => "PAYMENT_EXPIRED",
            Self::NotPending(_) => "PAYMENT_NOT_PENDING",
            Self::IntegrityMismatch => "INTEGRITY_CHECK_FAILED",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("Payment is locked due to security violations"),
            Self::Expired => f.write_str("Payment has expired"),
            Self::NotPending(status) => write!(f, "Payment status is {}", status),
            Self::IntegrityMismatch => f.write_str("QR code integrity check failed"),
        }
    }
}

/// Settings the payment state machine needs, taken from `AppConfig` once.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    pub lockout: LockoutPolicy,
    pub expiry: Duration,
    pub cancellation_window: Duration,
    pub refund_window: Duration,
    pub currency: String,
    pub merchant_upi_id: String,
    pub merchant_name: String,
}

impl PaymentPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lockout: config.lockout_policy(),
            expiry: config.payment_expiry(),
            cancellation_window: config.cancellation_window(),
            refund_window: config.refund_window(),
            currency: config.currency.clone(),
            merchant_upi_id: config.merchant_upi_id.clone(),
            merchant_name: config.merchant_name.clone(),
        }
    }
}

/// Whether an idempotent gateway-driven transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEffect {
    Applied,
    /// The charge was recorded but the booking could not be confirmed, so
    /// the customer is owed a refund.
    RefundDue,
    /// The payment was already settled or locked; nothing changed.
    Ignored,
}

// ==========================================
// CREATION
// ==========================================

/// The booking must belong to `user_id` and still be waiting for payment.
pub fn check_payable(booking: &BookingRecord, user_id: Uuid) -> Result<(), ServiceError> {
    if booking.user_id != user_id {
        return Err(ServiceError::not_found("Booking"));
    }
    if booking.status != BookingStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is {}, only pending bookings can be paid",
            booking.status
        )));
    }
    Ok(())
}

/// Decide whether an existing payment may be replaced by a new one.
///
/// A pending payment past its deadline is marked expired here; the caller
/// then deletes it and inserts the replacement in the same transaction.
pub fn check_replaceable(
    existing: &mut PaymentRecord,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if existing.is_locked {
        return Err(ServiceError::SecurityLockout(
            "The existing payment for this booking is locked due to security violations"
                .to_string(),
        ));
    }

    match existing.status {
        PaymentStatus::Pending if existing.is_expired(now) => {
            existing.status = PaymentStatus::Expired;
            info!("Payment {} expired and will be replaced", existing.id);
            Ok(())
        }
        PaymentStatus::Pending | PaymentStatus::Completed | PaymentStatus::Refunded => {
            Err(ServiceError::DuplicateActivePayment {
                payment_id: existing.id,
                expires_at: existing.expires_at,
            })
        }
        PaymentStatus::Expired | PaymentStatus::Failed => Ok(()),
    }
}

/// Build a fresh pending payment for `booking`.
///
/// UPI payments get their QR code rendered and hashed here; gateway
/// payments get their intent attached later with `attach_intent`.
pub fn new_payment(
    booking: &BookingRecord,
    method: PaymentMethod,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<PaymentRecord, ServiceError> {
    let mut payment = PaymentRecord {
        id: Uuid::new_v4(),
        booking_id: booking.id,
        transaction_id: utils::generate_transaction_id(now),
        amount: booking.total_amount,
        payment_method: method,
        status: PaymentStatus::Pending,
        security_token: utils::generate_security_token(),
        qr_payload: None,
        qr_image: None,
        qr_code_hash: String::new(),
        expires_at: now + policy.expiry,
        attempts: 0,
        last_attempt_at: None,
        is_locked: false,
        upi_id: policy.merchant_upi_id.clone(),
        created_at: now,
        completed_at: None,
        admin_notes: String::new(),
        created_by_admin: false,
        gateway_intent_id: None,
        gateway_client_secret: None,
        card_last_four: None,
        card_brand: None,
    };

    if !method.is_gateway() {
        render_payment_reference(&mut payment, policy)?;
    }
    Ok(payment)
}

pub fn attach_intent(payment: &mut PaymentRecord, intent: PaymentIntent) {
    payment.gateway_intent_id = Some(intent.intent_id);
    payment.gateway_client_secret = Some(intent.client_secret);
}

/// Build the UPI payment reference, render it as a PNG QR code and store
/// the image's integrity hash.
pub fn render_payment_reference(
    payment: &mut PaymentRecord,
    policy: &PaymentPolicy,
) -> Result<(), ServiceError> {
    let payload = format!(
        "upi://pay?pa={}&pn={}&am={}&tn={}&cu={}&mc=0000&tid={}",
        payment.upi_id,
        policy.merchant_name,
        utils::format_upi_amount(payment.amount),
        payment.transaction_id,
        policy.currency,
        payment.security_token,
    );
    let image = utils::render_qr_png(&payload).map_err(ServiceError::Rendering)?;
    payment.qr_code_hash = utils::sha256_hex(&image);
    payment.qr_image = Some(image);
    payment.qr_payload = Some(payload);
    Ok(())
}

// ==========================================
// CHECKS
// ==========================================

/// The stored QR image still hashes to the value recorded at render time.
///
/// Gateway payments carry no local artifact and always pass.
pub fn verify_integrity(payment: &PaymentRecord) -> bool {
    if payment.payment_method.is_gateway() {
        return true;
    }
    match &payment.qr_image {
        Some(image) if !payment.qr_code_hash.is_empty() => {
            utils::constant_time_eq(&utils::sha256_hex(image), &payment.qr_code_hash)
        }
        _ => false,
    }
}

/// Lock, then expiry, then status, then integrity.
pub fn can_process(payment: &PaymentRecord, now: DateTime<Utc>) -> Result<(), BlockReason> {
    if payment.is_locked {
        return Err(BlockReason::Locked);
    }
    if payment.is_expired(now) {
        return Err(BlockReason::Expired);
    }
    if payment.status != PaymentStatus::Pending {
        return Err(BlockReason::NotPending(payment.status));
    }
    if !verify_integrity(payment) {
        return Err(BlockReason::IntegrityMismatch);
    }
    Ok(())
}

/// Count one failed confirmation. At the threshold the payment locks and fails.
pub fn record_failed_attempt(
    payment: &mut PaymentRecord,
    policy: &LockoutPolicy,
    now: DateTime<Utc>,
) -> LockoutDecision {
    let decision = policy.record_failure(&mut payment.attempts);
    payment.last_attempt_at = Some(now);

    if decision.locked && !payment.is_locked {
        payment.is_locked = true;
        payment.status = PaymentStatus::Failed;
        let note = format!("Payment locked due to {} failed attempts", payment.attempts);
        payment.append_admin_note(now, &note);
        warn!("Payment {} locked after {} failed attempts", payment.id, payment.attempts);
    }
    decision
}

/// Count a failure and mirror a resulting lock onto the booking.
fn fail_attempt(ctx: &mut PaymentContext, policy: &PaymentPolicy, now: DateTime<Utc>) {
    let decision = record_failed_attempt(&mut ctx.payment, &policy.lockout, now);
    if decision.locked {
        ctx.booking.payment_status = BookingPaymentStatus::Failed;
        ctx.booking.updated_at = now;
    }
}

pub fn attempts_remaining(payment: &PaymentRecord, policy: &LockoutPolicy) -> i32 {
    policy.evaluate(payment.attempts).remaining
}

/// `can_process`, counting an integrity failure against the payment.
fn check_processable(
    ctx: &mut PaymentContext,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if let Err(reason) = can_process(&ctx.payment, now) {
        if reason == BlockReason::IntegrityMismatch {
            warn!("Integrity check failed for payment {}", ctx.payment.id);
            fail_attempt(ctx, policy, now);
        }
        return Err(reason.into());
    }
    Ok(())
}

/// Release the QR image of a payment the payer may still settle.
pub fn check_qr_access(
    ctx: &mut PaymentContext,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if ctx.payment.payment_method.is_gateway() || ctx.payment.qr_image.is_none() {
        return Err(ServiceError::NotFound(
            "QR code not available for this payment".to_string(),
        ));
    }
    check_processable(ctx, policy, now)
}

// ==========================================
// CONFIRMATION
// ==========================================

/// Settle a QR payment with the security token the payer echoed back.
///
/// An integrity failure or a wrong token counts as a failed attempt and is
/// persisted even though the confirmation itself fails.
pub fn confirm_local(
    ctx: &mut PaymentContext,
    token: &str,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if ctx.payment.payment_method.is_gateway() {
        return Err(ServiceError::InvalidTransition(
            "Card payments are confirmed through the payment gateway".to_string(),
        ));
    }

    check_processable(ctx, policy, now)?;

    if !utils::constant_time_eq(token, &ctx.payment.security_token) {
        warn!("Security token mismatch for payment {}", ctx.payment.id);
        fail_attempt(ctx, policy, now);
        return Err(ServiceError::TokenMismatch);
    }

    booking_lifecycle::confirm(&mut ctx.booking, now)?;
    complete(&mut ctx.payment, now);
    Ok(())
}

/// Apply a gateway-asserted success.
///
/// The deadline is not checked: once the processor has taken the money the
/// gateway is authoritative, so an expired payment is settled too. If the
/// booking was cancelled or marked no-show in the meantime the charge is
/// still recorded and reported as `RefundDue`. Settled, failed or locked
/// payments are left alone, so replays are harmless.
pub fn confirm_via_gateway(
    ctx: &mut PaymentContext,
    card: Option<&CardDetails>,
    now: DateTime<Utc>,
) -> GatewayEffect {
    let settleable = matches!(
        ctx.payment.status,
        PaymentStatus::Pending | PaymentStatus::Expired
    );
    if !settleable || ctx.payment.is_locked {
        info!(
            "Ignoring gateway success for payment {} in state {}",
            ctx.payment.id, ctx.payment.status
        );
        return GatewayEffect::Ignored;
    }

    if let Some(card) = card {
        ctx.payment.card_last_four = Some(card.last_four.clone());
        ctx.payment.card_brand = Some(card.brand.clone());
    }
    complete(&mut ctx.payment, now);

    match booking_lifecycle::confirm(&mut ctx.booking, now) {
        Ok(()) => GatewayEffect::Applied,
        Err(_) => {
            let note = format!(
                "Charged after the booking became {}; refund required",
                ctx.booking.status
            );
            ctx.payment.append_admin_note(now, &note);
            ctx.booking.payment_status = BookingPaymentStatus::Completed;
            ctx.booking.updated_at = now;
            warn!(
                "Payment {} charged for {} booking {}",
                ctx.payment.id, ctx.booking.status, ctx.booking.id
            );
            GatewayEffect::RefundDue
        }
    }
}

/// Apply a definitive gateway failure.
pub fn fail_via_gateway(ctx: &mut PaymentContext, reason: &str, now: DateTime<Utc>) -> GatewayEffect {
    if ctx.payment.status != PaymentStatus::Pending || ctx.payment.is_locked {
        return GatewayEffect::Ignored;
    }

    ctx.payment.status = PaymentStatus::Failed;
    ctx.payment.last_attempt_at = Some(now);
    ctx.payment.append_admin_note(now, &format!("Gateway failure: {}", reason));
    ctx.booking.payment_status = BookingPaymentStatus::Failed;
    ctx.booking.updated_at = now;

    info!("Payment {} failed at gateway: {}", ctx.payment.id, reason);
    GatewayEffect::Applied
}

fn complete(payment: &mut PaymentRecord, now: DateTime<Utc>) {
    payment.status = PaymentStatus::Completed;
    payment.completed_at = Some(now);
    info!("Payment {} completed", payment.id);
}

// ==========================================
// MAINTENANCE
// ==========================================

/// Issue a new token, reference and deadline for a QR payment.
///
/// Customers may only regenerate after the deadline has passed; admins may
/// regenerate at any time. Locked payments need an unlock first.
pub fn regenerate(
    ctx: &mut PaymentContext,
    by_admin: bool,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let payment = &mut ctx.payment;
    if payment.is_locked {
        return Err(BlockReason::Locked.into());
    }
    if payment.payment_method.is_gateway() {
        return Err(ServiceError::InvalidTransition(
            "Only QR payments can be regenerated".to_string(),
        ));
    }
    if matches!(payment.status, PaymentStatus::Completed | PaymentStatus::Refunded) {
        return Err(BlockReason::NotPending(payment.status).into());
    }
    if !by_admin && !payment.is_expired(now) {
        return Err(ServiceError::InvalidTransition(
            "Payment has not expired yet; only an administrator can regenerate it early"
                .to_string(),
        ));
    }
    if ctx.booking.status != BookingStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "Booking is {}, its payment can no longer be regenerated",
            ctx.booking.status
        )));
    }

    payment.status = PaymentStatus::Pending;
    payment.attempts = 0;
    payment.last_attempt_at = None;
    payment.security_token = utils::generate_security_token();
    payment.expires_at = now + policy.expiry;
    render_payment_reference(payment, policy)?;
    if by_admin {
        payment.created_by_admin = true;
        payment.append_admin_note(now, "QR regenerated by administrator");
    }
    ctx.booking.payment_status = BookingPaymentStatus::Pending;
    ctx.booking.updated_at = now;

    info!("Payment {} regenerated (admin: {})", ctx.payment.id, by_admin);
    Ok(())
}

/// Refund a completed payment and cancel its booking.
///
/// Requires more than the refund window before slot start. A booking that
/// is still active is cancelled (releasing its slot); an already cancelled
/// one keeps its released capacity.
pub fn refund(
    ctx: &mut PaymentContext,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if ctx.payment.status != PaymentStatus::Completed {
        return Err(ServiceError::InvalidTransition(format!(
            "Payment status is {}, only completed payments can be refunded",
            ctx.payment.status
        )));
    }
    if now >= ctx.slot.start_datetime() - policy.refund_window {
        return Err(ServiceError::CancellationWindowClosed(format!(
            "Refunds are only available more than {} hours before the slot starts",
            policy.refund_window.num_hours()
        )));
    }

    match ctx.booking.status {
        status if status.holds_capacity() => {
            booking_lifecycle::cancel(
                &mut ctx.booking,
                &mut ctx.slot,
                None,
                "Refund requested",
                now,
                policy.cancellation_window,
            )?;
        }
        BookingStatus::Cancelled => {}
        other => {
            return Err(ServiceError::InvalidTransition(format!(
                "Booking is {}, it can no longer be refunded",
                other
            )));
        }
    }

    ctx.payment.status = PaymentStatus::Refunded;
    ctx.payment.append_admin_note(now, "Refunded");
    ctx.booking.payment_status = BookingPaymentStatus::Refunded;
    ctx.booking.updated_at = now;

    info!("Payment {} refunded", ctx.payment.id);
    Ok(())
}

/// The payer abandons a pending payment: payment fails, booking is cancelled.
pub fn cancel_pending(
    ctx: &mut PaymentContext,
    policy: &PaymentPolicy,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if ctx.payment.is_locked {
        return Err(BlockReason::Locked.into());
    }
    if ctx.payment.status != PaymentStatus::Pending {
        return Err(BlockReason::NotPending(ctx.payment.status).into());
    }

    booking_lifecycle::cancel(
        &mut ctx.booking,
        &mut ctx.slot,
        None,
        "Payment cancelled by customer",
        now,
        policy.cancellation_window,
    )?;

    ctx.payment.status = PaymentStatus::Failed;
    ctx.payment.append_admin_note(now, "Cancelled by customer");
    ctx.booking.payment_status = BookingPaymentStatus::Failed;

    info!("Payment {} cancelled by customer", ctx.payment.id);
    Ok(())
}

/// Administrative reset of a locked payment.
///
/// The deadline is left as is; an expired payment still needs `regenerate`.
pub fn unlock(ctx: &mut PaymentContext, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if !ctx.payment.is_locked {
        return Err(ServiceError::InvalidTransition("Payment is not locked".to_string()));
    }

    ctx.payment.is_locked = false;
    ctx.payment.attempts = 0;
    ctx.payment.last_attempt_at = None;
    ctx.payment.status = PaymentStatus::Pending;
    ctx.payment.append_admin_note(now, "Unlocked by administrator");
    ctx.booking.payment_status = BookingPaymentStatus::Pending;
    ctx.booking.updated_at = now;

    info!("Payment {} unlocked", ctx.payment.id);
    Ok(())
}

/// Sweep rule: pending and past `cutoff` becomes expired. No capacity moves.
pub fn expire_if_stale(
    payment: &mut PaymentRecord,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if payment.status != PaymentStatus::Pending || payment.expires_at >= cutoff {
        return false;
    }
    payment.status = PaymentStatus::Expired;
    payment.append_admin_note(now, "Expired by sweeper");
    true
}
