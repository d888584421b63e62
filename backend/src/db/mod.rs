//! # Database Module
//!
//! This module handles all persistence for the booking backend.
//! We use PostgreSQL for storing:
//!
//! - Clubs and their bookable time slots
//! - Users, one-time login codes and the OTP request log
//! - Bookings and their (one) payment each
//!
//! ## Transactions
//!
//! Every state change runs through the `BookingStore` trait (`store.rs`).
//! Each trait method is exactly one transaction: lock the rows involved,
//! hand them to a pure transition function from `services/`, write back
//! whatever changed, commit. Nothing outside a store method ever mutates a
//! slot, booking or payment row.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DATABASE LAYER                              │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │              BookingStore (one method = one tx)           │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                 │                              │                 │
//! │                 ▼                              ▼                 │
//! │  ┌──────────────────────────┐    ┌──────────────────────────┐   │
//! │  │         PgStore          │    │       MemoryStore        │   │
//! │  │  deadpool-postgres pool  │    │  tables behind a mutex   │   │
//! │  │  SELECT ... FOR UPDATE   │    │  (tests, local dev)      │   │
//! │  └──────────────────────────┘    └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio_postgres::{Config as TokioConfig, NoTls};
use tracing::{error, info};

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored value could not be mapped onto its Rust type
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

/// Schema applied at startup. Every statement is idempotent.
const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Database connection wrapper.
///
/// This struct wraps the connection pool.
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...", 16).await?;
/// db.run_migrations().await?;
/// let store = PgStore::new(db);
/// ```
#[derive(Clone)]
pub struct Database {
    /// The connection pool
    pool: Pool,
}

impl Database {
    /// Connect to the PostgreSQL database.
    ///
    /// ## Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `pool_size` - Maximum pooled connections
    ///
    /// ## Returns
    ///
    /// * `Ok(Database)` - Connected successfully
    /// * `Err(DatabaseError)` - Connection failed
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        // Parse the connection string using tokio_postgres::Config
        let tokio_config = database_url
            .parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        // Convert to deadpool config
        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;
        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established (pool size {})", pool_size);

        Ok(Self { pool })
    }

    /// Apply `migrations/001_initial_schema.sql`.
    ///
    /// The schema uses `IF NOT EXISTS` throughout, so running it against an
    /// already migrated database is a no-op.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        if let Err(e) = client.batch_execute(INITIAL_SCHEMA).await {
            let detail = e
                .as_db_error()
                .and_then(|db_err| db_err.detail())
                .unwrap_or("No detail available");
            error!("Migration execution error: {}", e);
            error!("  Code: {:?}", e.code().map(|c| c.code()));
            error!("  Detail: {}", detail);
            return Err(DatabaseError::MigrationError(format!("{} ({})", e, detail)));
        }

        info!("Migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

// Re-export commonly used items
pub use memory::MemoryStore;
pub use models::*;
pub use store::{BookingStore, PaymentLookup, PgStore};
