//! # OTP Verification
//!
//! Phone-number login with one-time codes.
//!
//! ## Flow
//!
//! ```text
//! send(phone)
//!   │  ≤ OTP_MAX_SENDS_PER_HOUR per phone (rolling hour)   else RateLimited
//!   │  earlier codes for the phone are deleted
//!   ▼
//! 6-digit code, valid OTP_TTL_SECS ──► SMS via NotificationDispatcher
//!
//! verify(phone, code)
//!   │  account locked?                                     SecurityLockout
//!   │  newest unverified code for the phone, by (created_at, seq) desc
//!   │  none                                                NotFound
//!   │  older than the TTL                                  Expired
//!   │  attempts already at the threshold                   TooManyAttempts
//!   │  attempts += 1, code differs                         NotFound / TooManyAttempts
//!   ▼
//! code verified, user created or reset, session issued
//! ```
//!
//! Every rejected code except an expired one also counts as a failed login
//! on an existing account, which locks at the same threshold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{BookingStore, OtpRecord, UserRecord};
use crate::utils;

use super::error::ServiceError;
use super::lockout::LockoutPolicy;
use super::notifications::{params, templates, Notification, NotificationDispatcher};
use super::session::SessionIssuer;

/// Result of a successful `send`.
#[derive(Debug, Clone)]
pub struct OtpIssued {
    pub expires_at: DateTime<Utc>,
    /// The code itself, only when debug secrets are exposed.
    pub debug_code: Option<String>,
}

/// Result of a successful `verify`.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub token: String,
    pub user: UserRecord,
    pub new_user: bool,
}

/// Check `code` against `otp` and consume an attempt.
///
/// Expiry and exhaustion are checked before the attempt is counted, so a
/// dead code is never charged again.
pub fn check_and_consume(
    otp: &mut OtpRecord,
    code: &str,
    policy: &LockoutPolicy,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<(), ServiceError> {
    if now > otp.created_at + ttl {
        return Err(ServiceError::Expired("OTP has expired".to_string()));
    }
    if policy.evaluate(otp.attempts).locked {
        return Err(ServiceError::TooManyAttempts(
            "Too many failed attempts for this OTP. Request a new code".to_string(),
        ));
    }

    let decision = policy.record_failure(&mut otp.attempts);
    if !utils::constant_time_eq(code, &otp.code) {
        if decision.locked {
            warn!("OTP {} exhausted after {} attempts", otp.id, otp.attempts);
            return Err(ServiceError::TooManyAttempts(
                "Too many failed attempts for this OTP. Request a new code".to_string(),
            ));
        }
        return Err(ServiceError::NotFound("Invalid OTP".to_string()));
    }

    otp.is_verified = true;
    Ok(())
}

/// Count a failed login against an account, locking it at the threshold.
pub fn record_failed_login(user: &mut UserRecord, policy: &LockoutPolicy, now: DateTime<Utc>) {
    let decision = policy.record_failure(&mut user.failed_login_attempts);
    user.last_failed_login = Some(now);
    if decision.locked && !user.is_locked {
        user.is_locked = true;
        warn!(
            "User {} locked after {} failed logins",
            user.id, user.failed_login_attempts
        );
    }
}

fn reset_login_state(user: &mut UserRecord) {
    user.is_phone_verified = true;
    user.failed_login_attempts = 0;
    user.last_failed_login = None;
    user.is_locked = false;
}

/// OTP issuance, verification and account lockout.
#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn BookingStore>,
    dispatcher: NotificationDispatcher,
    sessions: Arc<dyn SessionIssuer>,
    lockout: LockoutPolicy,
    ttl: Duration,
    max_sends_per_hour: i64,
    expose_debug_secrets: bool,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        dispatcher: NotificationDispatcher,
        sessions: Arc<dyn SessionIssuer>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            sessions,
            lockout: config.lockout_policy(),
            ttl: config.otp_ttl(),
            max_sends_per_hour: config.otp_max_sends_per_hour,
            expose_debug_secrets: config.expose_debug_secrets,
        }
    }

    /// Issue a new code for `phone` and queue it for SMS delivery.
    pub async fn send(&self, phone: &str) -> Result<OtpIssued, ServiceError> {
        utils::validate_phone_number(phone)
            .map_err(|msg| ServiceError::validation("phoneNumber", &msg))?;

        let now = Utc::now();
        let max_sends = self.max_sends_per_hour;
        let phone_number = phone.to_string();

        let otp = self
            .store
            .issue_otp(
                phone,
                now - Duration::hours(1),
                Box::new(move |recent| {
                    if recent >= max_sends {
                        warn!(
                            "OTP rate limit hit for {} ({} requests this hour)",
                            utils::mask_phone(&phone_number),
                            recent
                        );
                        return Err(ServiceError::RateLimited(
                            "Too many OTP requests. Please try again later".to_string(),
                        ));
                    }
                    Ok(OtpRecord {
                        id: Uuid::new_v4(),
                        seq: 0,
                        phone_number,
                        code: utils::generate_otp_code(),
                        created_at: now,
                        is_verified: false,
                        attempts: 0,
                    })
                }),
            )
            .await?;

        info!("OTP issued for {}", utils::mask_phone(phone));
        self.dispatcher.dispatch(Notification::sms(
            phone,
            templates::OTP_CODE,
            params([
                ("code", otp.code.clone()),
                ("validMinutes", self.ttl.num_minutes().to_string()),
            ]),
        ));

        Ok(OtpIssued {
            expires_at: otp.created_at + self.ttl,
            debug_code: self.expose_debug_secrets.then_some(otp.code),
        })
    }

    /// Check a code, create or reset the account, and issue a session.
    pub async fn verify(&self, phone: &str, code: &str) -> Result<LoginResult, ServiceError> {
        let now = Utc::now();
        let lockout = self.lockout;
        let ttl = self.ttl;
        let code = code.to_string();

        let ctx = self
            .store
            .verify_otp(
                phone,
                Box::new(move |ctx| {
                    if ctx.user.as_ref().is_some_and(|u| u.is_locked) {
                        return Err(ServiceError::SecurityLockout(
                            "Account is locked due to too many failed login attempts".to_string(),
                        ));
                    }

                    let verdict = match ctx.otp.as_mut() {
                        Some(otp) => check_and_consume(otp, &code, &lockout, now, ttl),
                        None => Err(ServiceError::NotFound("Invalid OTP".to_string())),
                    };

                    match verdict {
                        Ok(()) => {
                            let phone_number = ctx.phone_number.clone();
                            let user = ctx
                                .user
                                .get_or_insert_with(|| UserRecord::new(&phone_number, now));
                            reset_login_state(user);
                            Ok(())
                        }
                        Err(e) => {
                            if !matches!(e, ServiceError::Expired(_)) {
                                if let Some(user) = ctx.user.as_mut() {
                                    record_failed_login(user, &lockout, now);
                                }
                            }
                            Err(e)
                        }
                    }
                }),
            )
            .await;

        let ctx = match ctx {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("OTP verification failed for {}: {}", utils::mask_phone(phone), e);
                return Err(e);
            }
        };
        let user = ctx.user.ok_or_else(|| ServiceError::not_found("User"))?;
        let new_user = user.date_joined == now;

        let token = self.sessions.issue(user.id, &user.phone_number, now).await;
        info!("User {} logged in (new: {})", user.id, new_user);

        Ok(LoginResult { token, user, new_user })
    }

    /// Administrative: clear a login lockout.
    pub async fn unlock_user(&self, phone: &str) -> Result<UserRecord, ServiceError> {
        let user = self
            .store
            .update_user(
                phone,
                Box::new(|user| {
                    if !user.is_locked {
                        return Err(ServiceError::InvalidTransition(
                            "User is not locked".to_string(),
                        ));
                    }
                    user.is_locked = false;
                    user.failed_login_attempts = 0;
                    user.last_failed_login = None;
                    Ok(())
                }),
            )
            .await?;

        info!("User {} unlocked by administrator", user.id);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::session::InMemorySessionIssuer;

    const PHONE: &str = "+919812345678";

    fn service(store: &MemoryStore) -> (OtpService, Arc<InMemorySessionIssuer>) {
        let config = AppConfig {
            expose_debug_secrets: true,
            ..AppConfig::default()
        };
        let (dispatcher, _rx) = NotificationDispatcher::new(64);
        let sessions = Arc::new(InMemorySessionIssuer::new());
        let svc = OtpService::new(Arc::new(store.clone()), dispatcher, sessions.clone(), &config);
        (svc, sessions)
    }

    fn wrong(code: &str) -> String {
        if code == "111111" {
            "222222".to_string()
        } else {
            "111111".to_string()
        }
    }

    fn otp(created_at: DateTime<Utc>) -> OtpRecord {
        OtpRecord {
            id: Uuid::new_v4(),
            seq: 1,
            phone_number: PHONE.to_string(),
            code: "482913".to_string(),
            created_at,
            is_verified: false,
            attempts: 0,
        }
    }

    #[test]
    fn test_expired_code_is_not_charged() {
        let now = Utc::now();
        let mut otp = otp(now - Duration::minutes(11));
        let ttl = Duration::minutes(10);
        let err = check_and_consume(&mut otp, "482913", &LockoutPolicy::default(), now, ttl)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Expired(_)));
        assert_eq!(otp.attempts, 0);
        assert!(!otp.is_verified);
    }

    #[test]
    fn test_correct_code_verifies() {
        let now = Utc::now();
        let mut otp = otp(now);
        let ttl = Duration::minutes(10);
        check_and_consume(&mut otp, "482913", &LockoutPolicy::default(), now, ttl).unwrap();
        assert!(otp.is_verified);
        assert_eq!(otp.attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_and_attempt_exhaustion() {
        let store = MemoryStore::new();
        let (svc, _) = service(&store);

        let mut last_code = String::new();
        for _ in 0..10 {
            last_code = svc.send(PHONE).await.unwrap().debug_code.unwrap();
        }
        let err = svc.send(PHONE).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimited(_)));

        let bad = wrong(&last_code);
        for _ in 0..4 {
            let err = svc.verify(PHONE, &bad).await.unwrap_err();
            assert!(matches!(err, ServiceError::NotFound(_)));
        }
        let err = svc.verify(PHONE, &bad).await.unwrap_err();
        assert!(matches!(err, ServiceError::TooManyAttempts(_)));

        // The right code no longer works.
        let err = svc.verify(PHONE, &last_code).await.unwrap_err();
        assert!(matches!(err, ServiceError::TooManyAttempts(_)));
        assert!(store.get_user_by_phone(PHONE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_successful_login_creates_user_and_session() {
        let store = MemoryStore::new();
        let (svc, sessions) = service(&store);

        let code = svc.send(PHONE).await.unwrap().debug_code.unwrap();
        let login = svc.verify(PHONE, &code).await.unwrap();

        assert!(login.user.is_phone_verified);
        let session = sessions.resolve(&login.token, Utc::now()).await.unwrap();
        assert_eq!(session.user_id, login.user.id);

        // A consumed code cannot be replayed.
        let err = svc.verify(PHONE, &code).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_logins_lock_existing_account_until_unlocked() {
        let store = MemoryStore::new();
        store.add_user(UserRecord::new(PHONE, Utc::now())).await;
        let (svc, _) = service(&store);

        for _ in 0..5 {
            assert!(svc.verify(PHONE, "000000").await.is_err());
        }
        let user = store.get_user_by_phone(PHONE).await.unwrap().unwrap();
        assert!(user.is_locked);
        assert_eq!(user.failed_login_attempts, 5);

        let code = svc.send(PHONE).await.unwrap().debug_code.unwrap();
        let err = svc.verify(PHONE, &code).await.unwrap_err();
        assert!(matches!(err, ServiceError::SecurityLockout(_)));

        svc.unlock_user(PHONE).await.unwrap();
        let login = svc.verify(PHONE, &code).await.unwrap();
        assert!(!login.new_user);
        assert_eq!(login.user.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn test_send_rejects_malformed_phone() {
        let store = MemoryStore::new();
        let (svc, _) = service(&store);
        let err = svc.send("98765").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
