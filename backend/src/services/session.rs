//! # Session Issuer
//!
//! Turns a verified login into an opaque bearer credential and back.
//! The core never looks inside a credential; it only asks the issuer who
//! it belongs to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::utils;

/// Sessions are valid for one day.
pub const SESSION_TTL_HOURS: i64 = 24;

/// Who a credential was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub phone_number: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionIssuer: Send + Sync {
    /// Issue a new credential for a verified user.
    async fn issue(&self, user_id: Uuid, phone_number: &str, now: DateTime<Utc>) -> String;

    /// Resolve a credential, or `None` when unknown or expired.
    async fn resolve(&self, token: &str, now: DateTime<Utc>) -> Option<Session>;
}

/// Process-local session table.
#[derive(Default)]
pub struct InMemorySessionIssuer {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionIssuer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionIssuer for InMemorySessionIssuer {
    async fn issue(&self, user_id: Uuid, phone_number: &str, now: DateTime<Utc>) -> String {
        let token = utils::generate_session_token();
        let session = Session {
            user_id,
            phone_number: phone_number.to_string(),
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
        };

        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(token.clone(), session);

        info!("Session issued for user {}", user_id);
        token
    }

    async fn resolve(&self, token: &str, now: DateTime<Utc>) -> Option<Session> {
        let sessions = self.sessions.read().await;
        match sessions.get(token) {
            Some(session) if session.expires_at > now => Some(session.clone()),
            Some(_) => {
                debug!("Rejected expired session");
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_resolve() {
        let issuer = InMemorySessionIssuer::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();

        let token = issuer.issue(user_id, "+919876543210", now).await;
        let session = issuer.resolve(&token, now).await.unwrap();
        assert_eq!(session.user_id, user_id);

        assert!(issuer.resolve("bogus", now).await.is_none());
    }

    #[tokio::test]
    async fn test_session_expires() {
        let issuer = InMemorySessionIssuer::new();
        let now = Utc::now();
        let token = issuer.issue(Uuid::new_v4(), "+919876543210", now).await;

        let later = now + Duration::hours(SESSION_TTL_HOURS) + Duration::seconds(1);
        assert!(issuer.resolve(&token, later).await.is_none());
    }
}
