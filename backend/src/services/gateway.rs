//! # Payment Gateway Adapter
//!
//! The boundary to the external card processor. Everything behind this
//! trait is an untrusted network service:
//!
//! | Outcome | `GatewayError` | What the payment lifecycle does |
//! |---------|----------------|---------------------------------|
//! | Network failure, timeout, 5xx, 429 | `Transient` | Nothing. The caller may retry |
//! | 4xx, declined, cancelled intent | `Definitive` | Payment transitions to `failed` |
//! | Bad webhook signature | `InvalidSignature` | Request rejected before any lookup |
//!
//! Gateway calls are never made while a store transaction is open: the
//! payment service reads, calls the gateway, and only then opens the
//! transaction that applies the result.
//!
//! ## Implementations
//!
//! - `StripeGateway` talks to the Stripe PaymentIntents API with `reqwest`.
//! - `MockGateway` settles locally; selected when no gateway key is configured.
//!
//! ## Webhook Signatures
//!
//! ```text
//! Stripe-Signature: t=1700000000,v1=5257a869...
//!
//! expected = hex(HMAC-SHA256(secret, "{t}.{raw body}"))
//! valid    = any v1 == expected  (constant time)  ∧  |now - t| ≤ 300s
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::PaymentMethod;
use crate::utils;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on webhook timestamps.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Retryable: nothing happened on our side.
    #[error("Gateway temporarily unavailable: {0}")]
    Transient(String),

    /// The gateway refused the operation for good.
    #[error("Gateway refused the request: {0}")]
    Definitive(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,
}

// ============================================
// CONTRACT TYPES
// ============================================

/// What the gateway needs to open an intent.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub transaction_id: String,
    pub booking_id: Uuid,
    pub payment_method: PaymentMethod,
}

/// Correlation data returned by intent creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    RequiresConfirmation,
    RequiresPaymentMethod,
    Canceled,
}

impl IntentStatus {
    fn from_stripe(status: &str) -> Option<Self> {
        match status {
            "succeeded" => Some(Self::Succeeded),
            "processing" => Some(Self::Processing),
            "requires_action" => Some(Self::RequiresAction),
            "requires_confirmation" => Some(Self::RequiresConfirmation),
            "requires_payment_method" => Some(Self::RequiresPaymentMethod),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Masked card metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDetails {
    pub last_four: String,
    pub brand: String,
}

/// Result of confirming an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentConfirmation {
    pub intent_id: String,
    pub status: IntentStatus,
    pub card: Option<CardDetails>,
    pub failure_message: Option<String>,
}

/// A verified, parsed webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub event_id: String,
    pub intent_id: Option<String>,
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    Succeeded,
    Failed(String),
    /// Acknowledged and ignored.
    Other(String),
}

/// The processor-facing half of the payment lifecycle.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open an intent for `request.amount`.
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError>;

    /// Confirm an intent with a client-side payment method token.
    async fn confirm_intent(
        &self,
        intent_id: &str,
        method_token: &str,
    ) -> Result<IntentConfirmation, GatewayError>;

    /// Check a webhook signature header against the raw body.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, now: DateTime<Utc>)
        -> bool;
}

// ============================================
// SIGNATURES AND EVENTS
// ============================================

/// Verify a `t=...,v1=...` signature header.
///
/// Returns false for an empty secret, a missing or stale timestamp, or no
/// matching `v1` entry.
pub fn verify_stripe_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> bool {
    if secret.is_empty() {
        return false;
    }

    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };
    let drift = now.timestamp().checked_sub(timestamp).map(i64::unsigned_abs);
    if drift.map_or(true, |d| d > WEBHOOK_TOLERANCE_SECS.unsigned_abs()) {
        debug!("Webhook timestamp {} outside tolerance", timestamp);
        return false;
    }

    signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    })
}

/// Build a signature header the same way the gateway does.
#[cfg(test)]
pub(crate) fn sign_webhook_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
struct StripeEventObject {
    id: Option<String>,
    last_payment_error: Option<StripeErrorDetail>,
}

/// Parse a webhook body. Only call this after the signature checked out.
pub fn parse_webhook_event(payload: &[u8]) -> Result<GatewayEvent, GatewayError> {
    let event: StripeEvent = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::Definitive(format!("Malformed webhook payload: {}", e)))?;

    let kind = match event.event_type.as_str() {
        "payment_intent.succeeded" => GatewayEventKind::Succeeded,
        "payment_intent.payment_failed" => GatewayEventKind::Failed(
            event
                .data
                .object
                .last_payment_error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Payment failed at gateway".to_string()),
        ),
        other => GatewayEventKind::Other(other.to_string()),
    };

    Ok(GatewayEvent {
        event_id: event.id,
        intent_id: event.data.object.id,
        kind,
    })
}

// ============================================
// STRIPE
// ============================================

#[derive(Debug, Deserialize)]
struct StripeIntentResponse {
    id: String,
    client_secret: Option<String>,
    status: String,
    payment_method: Option<serde_json::Value>,
    last_payment_error: Option<StripeErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Stripe PaymentIntents over HTTPS.
#[derive(Clone)]
pub struct StripeGateway {
    http_client: Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
}

impl StripeGateway {
    pub fn new(api_base: &str, secret_key: &str, webhook_secret: &str) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Definitive(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            webhook_secret: webhook_secret.to_string(),
        })
    }

    /// Send a form POST and classify the outcome.
    async fn post_form(
        &self,
        path: &str,
        params: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<StripeIntentResponse, GatewayError> {
        let mut request = self
            .http_client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(params);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            warn!("Gateway request to {} failed: {}", path, e);
            GatewayError::Transient(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<StripeIntentResponse>()
                .await
                .map_err(|e| GatewayError::Transient(format!("Unreadable gateway response: {}", e)));
        }

        let message = response
            .json::<StripeErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| format!("Gateway returned {}", status));

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            error!("Gateway {} on {}: {}", status, path, message);
            Err(GatewayError::Transient(message))
        } else {
            warn!("Gateway refused {} ({}): {}", path, status, message);
            Err(GatewayError::Definitive(message))
        }
    }
}

fn card_from_payment_method(value: &serde_json::Value) -> Option<CardDetails> {
    let card = value.get("card")?;
    Some(CardDetails {
        last_four: card.get("last4")?.as_str()?.to_string(),
        brand: card.get("brand")?.as_str()?.to_string(),
    })
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let params = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("payment_method_types[]", "card".to_string()),
            ("metadata[transaction_id]", request.transaction_id.clone()),
            ("metadata[booking_id]", request.booking_id.to_string()),
            ("metadata[payment_method]", request.payment_method.to_string()),
        ];

        let intent = self
            .post_form("/v1/payment_intents", &params, Some(&request.transaction_id))
            .await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| GatewayError::Transient("Intent returned without client secret".to_string()))?;

        info!("Created gateway intent {} for {}", intent.id, request.transaction_id);
        Ok(PaymentIntent {
            intent_id: intent.id,
            client_secret,
        })
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        method_token: &str,
    ) -> Result<IntentConfirmation, GatewayError> {
        let params = [
            ("payment_method", method_token.to_string()),
            ("expand[]", "payment_method".to_string()),
        ];

        let intent = self
            .post_form(&format!("/v1/payment_intents/{}/confirm", intent_id), &params, None)
            .await?;
        let status = IntentStatus::from_stripe(&intent.status).ok_or_else(|| {
            GatewayError::Transient(format!("Unknown intent status '{}'", intent.status))
        })?;

        Ok(IntentConfirmation {
            intent_id: intent.id,
            status,
            card: intent.payment_method.as_ref().and_then(card_from_payment_method),
            failure_message: intent.last_payment_error.and_then(|e| e.message),
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, now: DateTime<Utc>) -> bool {
        verify_stripe_signature(payload, signature, &self.webhook_secret, now)
    }
}

// ============================================
// MOCK
// ============================================

/// Local stand-in for the gateway.
///
/// Confirmation outcome is driven by the method token, mirroring the
/// processor's test tokens:
///
/// | Token | Outcome |
/// |-------|---------|
/// | `pm_card_chargeDeclined` | `Definitive` decline |
/// | `pm_card_processing` | status `processing` |
/// | `pm_card_unavailable` | `Transient` error |
/// | anything else | `succeeded`, Visa ending 4242 |
pub struct MockGateway {
    webhook_secret: String,
    calls: AtomicUsize,
}

impl MockGateway {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of network-equivalent calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let intent_id = format!("pi_mock_{}", Uuid::new_v4().simple());
        let client_secret = format!("{}_secret_{}", intent_id, utils::generate_security_token());

        debug!("Mock intent {} for {}", intent_id, request.transaction_id);
        Ok(PaymentIntent {
            intent_id,
            client_secret,
        })
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        method_token: &str,
    ) -> Result<IntentConfirmation, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match method_token {
            "pm_card_chargeDeclined" => {
                Err(GatewayError::Definitive("Your card was declined.".to_string()))
            }
            "pm_card_unavailable" => {
                Err(GatewayError::Transient("Mock gateway unavailable".to_string()))
            }
            "pm_card_processing" => Ok(IntentConfirmation {
                intent_id: intent_id.to_string(),
                status: IntentStatus::Processing,
                card: None,
                failure_message: None,
            }),
            _ => Ok(IntentConfirmation {
                intent_id: intent_id.to_string(),
                status: IntentStatus::Succeeded,
                card: Some(CardDetails {
                    last_four: "4242".to_string(),
                    brand: "visa".to_string(),
                }),
                failure_message: None,
            }),
        }
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str, now: DateTime<Utc>) -> bool {
        verify_stripe_signature(payload, signature, &self.webhook_secret, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn now() -> DateTime<Utc> {
        "2030-01-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_signature_accepts_valid_header() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_webhook_payload(payload, SECRET, now().timestamp());
        assert!(verify_stripe_signature(payload, &header, SECRET, now()));
    }

    #[test]
    fn test_signature_rejects_tampering_and_wrong_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_webhook_payload(payload, SECRET, now().timestamp());
        assert!(!verify_stripe_signature(br#"{"id":"evt_2"}"#, &header, SECRET, now()));
        assert!(!verify_stripe_signature(payload, &header, "whsec_other", now()));
        assert!(!verify_stripe_signature(payload, &header, "", now()));
        assert!(!verify_stripe_signature(payload, "v1=deadbeef", SECRET, now()));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let payload = b"{}";
        let stale = now().timestamp() - WEBHOOK_TOLERANCE_SECS - 1;
        let header = sign_webhook_payload(payload, SECRET, stale);
        assert!(!verify_stripe_signature(payload, &header, SECRET, now()));
    }

    #[test]
    fn test_signature_rejects_out_of_range_timestamps() {
        let payload = b"{}";
        for header in [
            format!("t={},v1=00", i64::MIN),
            format!("t={},v1=00", i64::MAX),
            sign_webhook_payload(payload, SECRET, i64::MIN),
        ] {
            assert!(!verify_stripe_signature(payload, &header, SECRET, now()));
        }
    }

    #[test]
    fn test_parse_webhook_events() {
        let succeeded = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_123"}}}"#;
        let event = parse_webhook_event(succeeded).unwrap();
        assert_eq!(event.intent_id.as_deref(), Some("pi_123"));
        assert_eq!(event.kind, GatewayEventKind::Succeeded);

        let failed = br#"{"id":"evt_2","type":"payment_intent.payment_failed","data":{"object":{"id":"pi_123","last_payment_error":{"message":"Insufficient funds"}}}}"#;
        let event = parse_webhook_event(failed).unwrap();
        assert_eq!(event.kind, GatewayEventKind::Failed("Insufficient funds".to_string()));

        let other = br#"{"id":"evt_3","type":"charge.refunded","data":{"object":{}}}"#;
        let event = parse_webhook_event(other).unwrap();
        assert_eq!(event.kind, GatewayEventKind::Other("charge.refunded".to_string()));

        assert!(parse_webhook_event(b"not json").is_err());
    }

    #[test]
    fn test_card_details_from_expanded_method() {
        let value = serde_json::json!({"id": "pm_1", "card": {"brand": "mastercard", "last4": "4444"}});
        assert_eq!(
            card_from_payment_method(&value),
            Some(CardDetails {
                last_four: "4444".to_string(),
                brand: "mastercard".to_string()
            })
        );
        assert_eq!(card_from_payment_method(&serde_json::json!("pm_1")), None);
    }

    #[tokio::test]
    async fn test_mock_gateway_outcomes() {
        let gateway = MockGateway::new(SECRET);
        let intent = gateway
            .create_intent(&IntentRequest {
                amount: 50_000,
                currency: "INR".to_string(),
                transaction_id: "TXN1".to_string(),
                booking_id: Uuid::new_v4(),
                payment_method: PaymentMethod::StripeCard,
            })
            .await
            .unwrap();
        assert!(intent.client_secret.starts_with(&intent.intent_id));

        let ok = gateway.confirm_intent(&intent.intent_id, "pm_card_visa").await.unwrap();
        assert_eq!(ok.status, IntentStatus::Succeeded);
        assert_eq!(ok.card.unwrap().last_four, "4242");

        assert!(matches!(
            gateway.confirm_intent(&intent.intent_id, "pm_card_chargeDeclined").await,
            Err(GatewayError::Definitive(_))
        ));
        assert!(matches!(
            gateway.confirm_intent(&intent.intent_id, "pm_card_unavailable").await,
            Err(GatewayError::Transient(_))
        ));
        assert_eq!(gateway.calls(), 4);
    }
}
