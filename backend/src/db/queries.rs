//! # Database Queries
//!
//! This module contains all the SQL for the PostgreSQL store.
//! Each function performs one statement.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on:
//! - `slot_*` / `*_slot` - Time slot reads and occupancy writes
//! - `*_booking` - Booking rows
//! - `*_payment` - Payment rows
//! - `*_user` - User accounts
//! - `*_otp` - OTP codes and the request log
//!
//! ## Clients
//!
//! Functions are generic over `tokio_postgres::GenericClient` so the same
//! statement runs on a pooled connection (`&**client`) or inside an open
//! transaction (`&*tx`). Functions taking a `lock` flag append
//! `FOR UPDATE` and must only be called inside a transaction.
//!
//! ## Error Handling
//!
//! All queries return `Result<T, DatabaseError>`. Common errors:
//! - `QueryError` - SQL execution failed
//! - `InvalidData` - A status column held an unknown value

use std::str::FromStr;

use chrono::{DateTime, Utc};
use tokio_postgres::{GenericClient, Row};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::PaymentLookup;
use super::DatabaseError;

// ============================================
// HELPER FUNCTIONS
// ============================================

fn parse_column<T>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(DatabaseError::InvalidData)
}

fn lock_suffix(lock: bool) -> &'static str {
    if lock {
        " FOR UPDATE"
    } else {
        ""
    }
}

const SLOT_SELECT: &str = r#"
    SELECT
        s.id, s.club_id, c.name AS club_name, c.price_per_hour AS club_price_per_hour,
        s.date, s.start_time, s.end_time, s.sport,
        s.max_capacity, s.current_bookings, s.is_available, s.price_override
    FROM time_slots s
    JOIN clubs c ON c.id = s.club_id
"#;

const BOOKING_COLUMNS: &str = r#"
    id, user_id, club_id, time_slot_id, booking_date, status, payment_status,
    total_amount, special_requests, cancelled_at, cancellation_reason,
    admin_notes, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, booking_id, transaction_id, amount, payment_method, status,
    security_token, qr_payload, qr_image, qr_code_hash, expires_at, attempts,
    last_attempt_at, is_locked, upi_id, created_at, completed_at,
    admin_notes, created_by_admin, gateway_intent_id, gateway_client_secret,
    card_last_four, card_brand
"#;

const USER_COLUMNS: &str = r#"
    id, phone_number, email, is_phone_verified, failed_login_attempts,
    last_failed_login, is_locked, date_joined
"#;

/// Helper to convert a database row to TimeSlotRecord
fn row_to_slot(row: &Row) -> Result<TimeSlotRecord, DatabaseError> {
    Ok(TimeSlotRecord {
        id: row.try_get("id")?,
        club_id: row.try_get("club_id")?,
        club_name: row.try_get("club_name")?,
        club_price_per_hour: row.try_get("club_price_per_hour")?,
        date: row.try_get("date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        sport: row.try_get("sport")?,
        max_capacity: row.try_get("max_capacity")?,
        current_bookings: row.try_get("current_bookings")?,
        is_available: row.try_get("is_available")?,
        price_override: row.try_get("price_override")?,
    })
}

/// Helper to convert a database row to BookingRecord
fn row_to_booking(row: &Row) -> Result<BookingRecord, DatabaseError> {
    Ok(BookingRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        club_id: row.try_get("club_id")?,
        time_slot_id: row.try_get("time_slot_id")?,
        booking_date: row.try_get("booking_date")?,
        status: parse_column(row, "status")?,
        payment_status: parse_column(row, "payment_status")?,
        total_amount: row.try_get("total_amount")?,
        special_requests: row.try_get("special_requests")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        admin_notes: row.try_get("admin_notes")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Helper to convert a database row to PaymentRecord
fn row_to_payment(row: &Row) -> Result<PaymentRecord, DatabaseError> {
    Ok(PaymentRecord {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        transaction_id: row.try_get("transaction_id")?,
        amount: row.try_get("amount")?,
        payment_method: parse_column(row, "payment_method")?,
        status: parse_column(row, "status")?,
        security_token: row.try_get("security_token")?,
        qr_payload: row.try_get("qr_payload")?,
        qr_image: row.try_get("qr_image")?,
        qr_code_hash: row.try_get("qr_code_hash")?,
        expires_at: row.try_get("expires_at")?,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        is_locked: row.try_get("is_locked")?,
        upi_id: row.try_get("upi_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        admin_notes: row.try_get("admin_notes")?,
        created_by_admin: row.try_get("created_by_admin")?,
        gateway_intent_id: row.try_get("gateway_intent_id")?,
        gateway_client_secret: row.try_get("gateway_client_secret")?,
        card_last_four: row.try_get("card_last_four")?,
        card_brand: row.try_get("card_brand")?,
    })
}

/// Helper to convert a database row to UserRecord
fn row_to_user(row: &Row) -> Result<UserRecord, DatabaseError> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        phone_number: row.try_get("phone_number")?,
        email: row.try_get("email")?,
        is_phone_verified: row.try_get("is_phone_verified")?,
        failed_login_attempts: row.try_get("failed_login_attempts")?,
        last_failed_login: row.try_get("last_failed_login")?,
        is_locked: row.try_get("is_locked")?,
        date_joined: row.try_get("date_joined")?,
    })
}

/// Helper to convert a database row to OtpRecord
fn row_to_otp(row: &Row) -> Result<OtpRecord, DatabaseError> {
    Ok(OtpRecord {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        phone_number: row.try_get("phone_number")?,
        code: row.try_get("code")?,
        created_at: row.try_get("created_at")?,
        is_verified: row.try_get("is_verified")?,
        attempts: row.try_get("attempts")?,
    })
}

// ============================================
// SLOT QUERIES
// ============================================

/// Get a slot joined with its club. With `lock`, only the slot row is locked.
pub async fn get_slot<C: GenericClient + Sync>(
    client: &C,
    slot_id: i64,
    lock: bool,
) -> Result<Option<TimeSlotRecord>, DatabaseError> {
    debug!("Fetching slot {} (lock: {})", slot_id, lock);

    let sql = format!(
        "{} WHERE s.id = $1{}",
        SLOT_SELECT,
        if lock { " FOR UPDATE OF s" } else { "" }
    );
    client
        .query_opt(sql.as_str(), &[&slot_id])
        .await?
        .map(|row| row_to_slot(&row))
        .transpose()
}

/// Write back occupancy. Nothing else on a slot is mutable from here.
pub async fn update_slot_occupancy<C: GenericClient + Sync>(
    client: &C,
    slot: &TimeSlotRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            UPDATE time_slots
            SET current_bookings = $2, is_available = $3
            WHERE id = $1
            "#,
            &[&slot.id, &slot.current_bookings, &slot.is_available],
        )
        .await?;
    Ok(())
}

// ============================================
// BOOKING QUERIES
// ============================================

pub async fn get_booking<C: GenericClient + Sync>(
    client: &C,
    booking_id: Uuid,
    lock: bool,
) -> Result<Option<BookingRecord>, DatabaseError> {
    debug!("Fetching booking {} (lock: {})", booking_id, lock);

    let sql = format!(
        "SELECT {} FROM bookings WHERE id = $1{}",
        BOOKING_COLUMNS,
        lock_suffix(lock)
    );
    client
        .query_opt(sql.as_str(), &[&booking_id])
        .await?
        .map(|row| row_to_booking(&row))
        .transpose()
}

pub async fn insert_booking<C: GenericClient + Sync>(
    client: &C,
    booking: &BookingRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO bookings (
                id, user_id, club_id, time_slot_id, booking_date, status,
                payment_status, total_amount, special_requests, cancelled_at,
                cancellation_reason, admin_notes, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
            &[
                &booking.id,
                &booking.user_id,
                &booking.club_id,
                &booking.time_slot_id,
                &booking.booking_date,
                &booking.status.as_str(),
                &booking.payment_status.as_str(),
                &booking.total_amount,
                &booking.special_requests,
                &booking.cancelled_at,
                &booking.cancellation_reason,
                &booking.admin_notes,
                &booking.updated_at,
            ],
        )
        .await?;
    Ok(())
}

/// Write back the mutable booking fields. `total_amount` is never rewritten.
pub async fn update_booking<C: GenericClient + Sync>(
    client: &C,
    booking: &BookingRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            UPDATE bookings
            SET status = $2, payment_status = $3, cancelled_at = $4,
                cancellation_reason = $5, admin_notes = $6, updated_at = $7
            WHERE id = $1
            "#,
            &[
                &booking.id,
                &booking.status.as_str(),
                &booking.payment_status.as_str(),
                &booking.cancelled_at,
                &booking.cancellation_reason,
                &booking.admin_notes,
                &booking.updated_at,
            ],
        )
        .await?;
    Ok(())
}

// ============================================
// PAYMENT QUERIES
// ============================================

pub async fn get_payment_for_booking<C: GenericClient + Sync>(
    client: &C,
    booking_id: Uuid,
    lock: bool,
) -> Result<Option<PaymentRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM payments WHERE booking_id = $1{}",
        PAYMENT_COLUMNS,
        lock_suffix(lock)
    );
    client
        .query_opt(sql.as_str(), &[&booking_id])
        .await?
        .map(|row| row_to_payment(&row))
        .transpose()
}

/// Unlocked read of a payment by any of its identifiers.
pub async fn find_payment<C: GenericClient + Sync>(
    client: &C,
    lookup: &PaymentLookup,
) -> Result<Option<PaymentRecord>, DatabaseError> {
    debug!("Looking up payment by {:?}", lookup);

    let row = match lookup {
        PaymentLookup::Id(id) => {
            let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
            client.query_opt(sql.as_str(), &[id]).await?
        }
        PaymentLookup::TransactionId(txn) => {
            let sql = format!(
                "SELECT {} FROM payments WHERE transaction_id = $1",
                PAYMENT_COLUMNS
            );
            client.query_opt(sql.as_str(), &[txn]).await?
        }
        PaymentLookup::GatewayIntent(intent) => {
            let sql = format!(
                "SELECT {} FROM payments WHERE gateway_intent_id = $1",
                PAYMENT_COLUMNS
            );
            client.query_opt(sql.as_str(), &[intent]).await?
        }
    };
    row.map(|row| row_to_payment(&row)).transpose()
}

pub async fn insert_payment<C: GenericClient + Sync>(
    client: &C,
    payment: &PaymentRecord,
) -> Result<(), DatabaseError> {
    let sql = format!(
        r#"
        INSERT INTO payments ({})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
        "#,
        PAYMENT_COLUMNS
    );
    client
        .execute(
            sql.as_str(),
            &[
                &payment.id,
                &payment.booking_id,
                &payment.transaction_id,
                &payment.amount,
                &payment.payment_method.as_str(),
                &payment.status.as_str(),
                &payment.security_token,
                &payment.qr_payload,
                &payment.qr_image,
                &payment.qr_code_hash,
                &payment.expires_at,
                &payment.attempts,
                &payment.last_attempt_at,
                &payment.is_locked,
                &payment.upi_id,
                &payment.created_at,
                &payment.completed_at,
                &payment.admin_notes,
                &payment.created_by_admin,
                &payment.gateway_intent_id,
                &payment.gateway_client_secret,
                &payment.card_last_four,
                &payment.card_brand,
            ],
        )
        .await?;
    Ok(())
}

/// Write back the mutable payment fields. Amount, method and identifiers
/// are fixed at creation.
pub async fn update_payment<C: GenericClient + Sync>(
    client: &C,
    payment: &PaymentRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            UPDATE payments
            SET status = $2, security_token = $3, qr_payload = $4, qr_image = $5,
                qr_code_hash = $6, expires_at = $7, attempts = $8, last_attempt_at = $9,
                is_locked = $10, completed_at = $11, admin_notes = $12,
                created_by_admin = $13, card_last_four = $14, card_brand = $15
            WHERE id = $1
            "#,
            &[
                &payment.id,
                &payment.status.as_str(),
                &payment.security_token,
                &payment.qr_payload,
                &payment.qr_image,
                &payment.qr_code_hash,
                &payment.expires_at,
                &payment.attempts,
                &payment.last_attempt_at,
                &payment.is_locked,
                &payment.completed_at,
                &payment.admin_notes,
                &payment.created_by_admin,
                &payment.card_last_four,
                &payment.card_brand,
            ],
        )
        .await?;
    Ok(())
}

pub async fn delete_payment<C: GenericClient + Sync>(
    client: &C,
    payment_id: Uuid,
) -> Result<(), DatabaseError> {
    client
        .execute("DELETE FROM payments WHERE id = $1", &[&payment_id])
        .await?;
    Ok(())
}

/// Mark every pending payment whose deadline is before `cutoff` as expired.
pub async fn expire_stale_payments<C: GenericClient + Sync>(
    client: &C,
    cutoff: DateTime<Utc>,
    note: &str,
) -> Result<Vec<Uuid>, DatabaseError> {
    let rows = client
        .query(
            r#"
            UPDATE payments
            SET status = 'expired',
                admin_notes = CASE WHEN admin_notes = '' THEN $2
                                   ELSE admin_notes || E'\n' || $2 END
            WHERE status = 'pending' AND expires_at < $1
            RETURNING id
            "#,
            &[&cutoff, &note],
        )
        .await?;

    rows.iter()
        .map(|row| row.try_get::<_, Uuid>("id").map_err(DatabaseError::from))
        .collect()
}

pub async fn count_locked_payments<C: GenericClient + Sync>(
    client: &C,
) -> Result<i64, DatabaseError> {
    let row = client
        .query_one("SELECT COUNT(*) AS n FROM payments WHERE is_locked", &[])
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn count_suspicious_payments<C: GenericClient + Sync>(
    client: &C,
    min_attempts: i32,
) -> Result<i64, DatabaseError> {
    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM payments WHERE NOT is_locked AND attempts >= $1",
            &[&min_attempts],
        )
        .await?;
    Ok(row.try_get("n")?)
}

/// Most recently active locked payments first.
pub async fn recent_locked_payments<C: GenericClient + Sync>(
    client: &C,
    limit: i64,
) -> Result<Vec<PaymentRecord>, DatabaseError> {
    let sql = format!(
        r#"
        SELECT {} FROM payments
        WHERE is_locked
        ORDER BY COALESCE(last_attempt_at, created_at) DESC
        LIMIT $1
        "#,
        PAYMENT_COLUMNS
    );
    let rows = client.query(sql.as_str(), &[&limit]).await?;
    rows.iter().map(row_to_payment).collect()
}

// ============================================
// USER QUERIES
// ============================================

pub async fn get_user<C: GenericClient + Sync>(
    client: &C,
    user_id: Uuid,
) -> Result<Option<UserRecord>, DatabaseError> {
    let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
    client
        .query_opt(sql.as_str(), &[&user_id])
        .await?
        .map(|row| row_to_user(&row))
        .transpose()
}

pub async fn get_user_by_phone<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
    lock: bool,
) -> Result<Option<UserRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM users WHERE phone_number = $1{}",
        USER_COLUMNS,
        lock_suffix(lock)
    );
    client
        .query_opt(sql.as_str(), &[&phone])
        .await?
        .map(|row| row_to_user(&row))
        .transpose()
}

pub async fn insert_user<C: GenericClient + Sync>(
    client: &C,
    user: &UserRecord,
) -> Result<(), DatabaseError> {
    let sql = format!(
        "INSERT INTO users ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        USER_COLUMNS
    );
    client
        .execute(
            sql.as_str(),
            &[
                &user.id,
                &user.phone_number,
                &user.email,
                &user.is_phone_verified,
                &user.failed_login_attempts,
                &user.last_failed_login,
                &user.is_locked,
                &user.date_joined,
            ],
        )
        .await?;
    Ok(())
}

pub async fn update_user<C: GenericClient + Sync>(
    client: &C,
    user: &UserRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            UPDATE users
            SET email = $2, is_phone_verified = $3, failed_login_attempts = $4,
                last_failed_login = $5, is_locked = $6
            WHERE id = $1
            "#,
            &[
                &user.id,
                &user.email,
                &user.is_phone_verified,
                &user.failed_login_attempts,
                &user.last_failed_login,
                &user.is_locked,
            ],
        )
        .await?;
    Ok(())
}

// ============================================
// OTP QUERIES
// ============================================

/// Serialize all OTP work for one phone until the transaction ends.
pub async fn lock_phone<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
) -> Result<(), DatabaseError> {
    client
        .execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&phone])
        .await?;
    Ok(())
}

pub async fn count_otp_requests_since<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
    since: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let row = client
        .query_one(
            r#"
            SELECT COUNT(*) AS n FROM otp_requests
            WHERE phone_number = $1 AND requested_at > $2
            "#,
            &[&phone, &since],
        )
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn insert_otp_request<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
    requested_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    client
        .execute(
            "INSERT INTO otp_requests (phone_number, requested_at) VALUES ($1, $2)",
            &[&phone, &requested_at],
        )
        .await?;
    Ok(())
}

/// Drop a phone's request log entries that fall outside the rate window.
pub async fn delete_otp_requests_before<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    Ok(client
        .execute(
            "DELETE FROM otp_requests WHERE phone_number = $1 AND requested_at <= $2",
            &[&phone, &cutoff],
        )
        .await?)
}

pub async fn delete_otps_for_phone<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
) -> Result<u64, DatabaseError> {
    Ok(client
        .execute("DELETE FROM otps WHERE phone_number = $1", &[&phone])
        .await?)
}

/// Insert a code and return it with its assigned sequence number.
pub async fn insert_otp<C: GenericClient + Sync>(
    client: &C,
    otp: &OtpRecord,
) -> Result<OtpRecord, DatabaseError> {
    let row = client
        .query_one(
            r#"
            INSERT INTO otps (id, phone_number, code, created_at, is_verified, attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, seq, phone_number, code, created_at, is_verified, attempts
            "#,
            &[
                &otp.id,
                &otp.phone_number,
                &otp.code,
                &otp.created_at,
                &otp.is_verified,
                &otp.attempts,
            ],
        )
        .await?;
    row_to_otp(&row)
}

/// Newest unverified code for a phone: `created_at` descending, then `seq`.
pub async fn newest_unverified_otp<C: GenericClient + Sync>(
    client: &C,
    phone: &str,
    lock: bool,
) -> Result<Option<OtpRecord>, DatabaseError> {
    let sql = format!(
        r#"
        SELECT id, seq, phone_number, code, created_at, is_verified, attempts
        FROM otps
        WHERE phone_number = $1 AND NOT is_verified
        ORDER BY created_at DESC, seq DESC
        LIMIT 1{}
        "#,
        lock_suffix(lock)
    );
    client
        .query_opt(sql.as_str(), &[&phone])
        .await?
        .map(|row| row_to_otp(&row))
        .transpose()
}

pub async fn update_otp<C: GenericClient + Sync>(
    client: &C,
    otp: &OtpRecord,
) -> Result<(), DatabaseError> {
    client
        .execute(
            "UPDATE otps SET is_verified = $2, attempts = $3 WHERE id = $1",
            &[&otp.id, &otp.is_verified, &otp.attempts],
        )
        .await?;
    Ok(())
}
