//! # Notification Dispatcher
//!
//! Fire-and-forget delivery of SMS and email messages.
//!
//! ```text
//!   services ──dispatch()──► bounded mpsc queue ──► run_worker() ──► NotificationSink
//!            (never blocks,                          (background      (SMS / email
//!             never fails the caller)                 task)            provider)
//! ```
//!
//! Callers dispatch only after their transaction has committed. A full or
//! closed queue drops the message with a warning; a sink failure is logged
//! by the worker. Neither ever reaches the request that caused it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::db::UserRecord;
use crate::utils;

/// Template identifiers understood by the delivery provider.
pub mod templates {
    pub const OTP_CODE: &str = "otp_code";
    pub const BOOKING_CONFIRMED: &str = "booking_confirmed";
    pub const PAYMENT_CONFIRMED: &str = "payment_confirmed";
    pub const REFUND_REQUESTED: &str = "refund_requested";
    pub const PAYMENT_REFUNDED: &str = "payment_refunded";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Sms,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: Channel,
    pub address: String,
    pub template_id: String,
    pub params: BTreeMap<String, String>,
}

impl Notification {
    pub fn sms(phone: &str, template_id: &str, params: BTreeMap<String, String>) -> Self {
        Self {
            channel: Channel::Sms,
            address: phone.to_string(),
            template_id: template_id.to_string(),
            params,
        }
    }

    /// Email when the user has an address on file, SMS otherwise.
    pub fn for_user(user: &UserRecord, template_id: &str, params: BTreeMap<String, String>) -> Self {
        match &user.email {
            Some(email) if !email.is_empty() => Self {
                channel: Channel::Email,
                address: email.clone(),
                template_id: template_id.to_string(),
                params,
            },
            _ => Self::sms(&user.phone_number, template_id, params),
        }
    }

    fn masked_address(&self) -> String {
        match self.channel {
            Channel::Sms => utils::mask_phone(&self.address),
            Channel::Email => match self.address.split_once('@') {
                Some((_, domain)) => format!("***@{}", domain),
                None => "***".to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// The external delivery provider.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Sink that only logs. Used when no provider is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            "📨 {:?} '{}' to {}",
            notification.channel,
            notification.template_id,
            notification.masked_address()
        );
        Ok(())
    }
}

/// Handle used by services to enqueue notifications.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// Create a dispatcher and the receiving end for `run_worker`.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. Returns whether the message was accepted.
    pub fn dispatch(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                warn!(
                    "Notification queue full, dropping '{}' to {}",
                    n.template_id,
                    n.masked_address()
                );
                false
            }
            Err(TrySendError::Closed(n)) => {
                warn!(
                    "Notification worker stopped, dropping '{}' to {}",
                    n.template_id,
                    n.masked_address()
                );
                false
            }
        }
    }
}

/// Drain the queue into `sink` until every dispatcher handle is dropped.
pub async fn run_worker(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
) {
    info!("Notification worker started");

    while let Some(notification) = rx.recv().await {
        debug!("Delivering '{}'", notification.template_id);
        if let Err(e) = sink.deliver(&notification).await {
            error!(
                "Failed to deliver '{}' to {}: {}",
                notification.template_id,
                notification.masked_address(),
                e
            );
        }
    }

    info!("Notification worker stopped");
}

/// Build a parameter map from string pairs.
pub fn params<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
            if self.fail {
                return Err(NotificationError::DeliveryFailed("provider down".to_string()));
            }
            self.delivered.lock().await.push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn test_for_user_prefers_email() {
        let mut user = UserRecord::new("+919876543210", Utc::now());
        let sms = Notification::for_user(&user, templates::PAYMENT_CONFIRMED, BTreeMap::new());
        assert_eq!(sms.channel, Channel::Sms);
        assert_eq!(sms.address, "+919876543210");

        user.email = Some("player@example.com".to_string());
        let email = Notification::for_user(&user, templates::PAYMENT_CONFIRMED, BTreeMap::new());
        assert_eq!(email.channel, Channel::Email);
        assert_eq!(email.masked_address(), "***@example.com");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (dispatcher, _rx) = NotificationDispatcher::new(1);
        let n = Notification::sms("+919876543210", templates::OTP_CODE, BTreeMap::new());

        assert!(dispatcher.dispatch(n.clone()));
        assert!(!dispatcher.dispatch(n));
    }

    #[tokio::test]
    async fn test_closed_queue_is_reported() {
        let (dispatcher, rx) = NotificationDispatcher::new(4);
        drop(rx);
        let n = Notification::sms("+919876543210", templates::OTP_CODE, BTreeMap::new());
        assert!(!dispatcher.dispatch(n));
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order() {
        let (dispatcher, rx) = NotificationDispatcher::new(8);
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
            fail: false,
        });

        dispatcher.dispatch(Notification::sms(
            "+919876543210",
            templates::OTP_CODE,
            params([("code", "123456".to_string())]),
        ));
        dispatcher.dispatch(Notification::sms(
            "+919876543210",
            templates::BOOKING_CONFIRMED,
            BTreeMap::new(),
        ));
        drop(dispatcher);

        run_worker(rx, sink.clone()).await;

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].params["code"], "123456");
        assert_eq!(delivered[1].template_id, templates::BOOKING_CONFIRMED);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_worker() {
        let (dispatcher, rx) = NotificationDispatcher::new(8);
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
            fail: true,
        });
        dispatcher.dispatch(Notification::sms("+1", templates::OTP_CODE, BTreeMap::new()));
        dispatcher.dispatch(Notification::sms("+1", templates::OTP_CODE, BTreeMap::new()));
        drop(dispatcher);

        // Returns once the queue is drained despite both deliveries failing.
        run_worker(rx, sink).await;
    }
}
