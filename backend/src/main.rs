//! # Sports Booking Backend Service
//!
//! This is the main entry point for the backend service behind the
//! sports-facility booking app. It provides:
//!
//! - REST API for OTP login, slot bookings and payments
//! - Payment gateway integration (Stripe, or a mock for development)
//! - Background services for notifications and payment expiry
//! - PostgreSQL storage, or an in-memory store for local runs
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                           │
//! │                                                                  │
//! │  ┌──────────────────────────────┐  ┌─────────────────────────┐  │
//! │  │          REST API            │  │   Background Services   │  │
//! │  │          (Actix)             │  │  • Notification worker  │  │
//! │  │  /auth/otp  /bookings        │  │  • Expiry sweeper       │  │
//! │  │  /payments  /admin           │  │                         │  │
//! │  └──────────────────────────────┘  └─────────────────────────┘  │
//! │                 │                              │                 │
//! │  ┌──────────────┴──────────────────────────────┴─────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────┐   │  │
//! │  │  │BookingService│ │PaymentService│ │OtpService        │   │  │
//! │  │  └──────────────┘ └──────────────┘ └──────────────────┘   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                   │                   │
//! │                   ┌──────┴──────┐     ┌──────┴──────┐            │
//! │                   │ BookingStore│     │   Payment   │            │
//! │                   │ (Postgres / │     │   Gateway   │            │
//! │                   │  memory)    │     │             │            │
//! │                   └─────────────┘     └─────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Copy `.env.example` to `.env` and configure
//! 2. Optionally set `DATABASE_URL`; migrations run on startup
//! 3. Start the server: `cargo run`
//!
//! ## Environment Variables
//!
//! See `.env.example` for all configuration.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod db;
mod models;
mod services;
mod utils;

use config::AppConfig;
use db::{BookingStore, Database, MemoryStore, PgStore};
use services::notifications::{run_worker, LogSink};
use services::{
    BookingService, ExpirySweeper, InMemorySessionIssuer, MockGateway, NotificationDispatcher,
    OtpService, PaymentGateway, PaymentPolicy, PaymentService, SessionIssuer, StripeGateway,
};

/// Notifications waiting for the worker before new ones are dropped.
const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// Application state shared across all handlers.
///
/// Every service holds its own `Arc` to the store, so cloning the
/// services is cheap and handlers never lock anything here.
pub struct AppState {
    /// Booking persistence (PostgreSQL or in-memory)
    pub store: Arc<dyn BookingStore>,

    pub bookings: BookingService,

    pub payments: PaymentService,

    pub otp: OtpService,

    /// Resolves bearer credentials for the auth extractor
    pub sessions: Arc<dyn SessionIssuer>,

    /// Application configuration
    pub config: AppConfig,
}

impl AppState {
    /// Wire the services around a store and a gateway.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let sessions: Arc<dyn SessionIssuer> = Arc::new(InMemorySessionIssuer::new());

        let bookings = BookingService::new(
            store.clone(),
            dispatcher.clone(),
            config.cancellation_window(),
        );
        let payments = PaymentService::new(
            store.clone(),
            gateway,
            dispatcher.clone(),
            PaymentPolicy::from_config(&config),
        );
        let otp = OtpService::new(store.clone(), dispatcher, sessions.clone(), &config);

        Self {
            store,
            bookings,
            payments,
            otp,
            sessions,
            config,
        }
    }
}

/// Main entry point for the backend service.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Initializes logging
/// 3. Connects the store
/// 4. Selects the payment gateway
/// 5. Starts background services
/// 6. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Load Configuration
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // =========================================
    // STEP 2: Initialize Logging
    // =========================================
    // RUST_LOG wins over LOG_LEVEL when both are set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("🚀 Starting Sports Booking Backend Service");
    info!("📋 Configuration loaded");
    info!("   Payment expiry: {}s", config.payment_expiry_secs);
    info!("   Lockout threshold: {}", config.lockout_threshold);
    if config.expose_debug_secrets {
        warn!("   EXPOSE_DEBUG_SECRETS is on: OTP codes and tokens appear in responses");
    }

    // =========================================
    // STEP 3: Initialize Store
    // =========================================
    let store: Arc<dyn BookingStore> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url, config.database_pool_size)
                .await
                .expect("Failed to connect to database");
            info!("🗄️  Database connected");

            db.run_migrations()
                .await
                .expect("Failed to run migrations");
            info!("📦 Database migrations complete");

            Arc::new(PgStore::new(db))
        }
        None => {
            warn!("🗄️  DATABASE_URL not set; using the in-memory store (data is lost on exit)");
            let memory = MemoryStore::new();
            let slots = memory
                .seed_demo(chrono::Utc::now().date_naive())
                .await
                .expect("Failed to seed demo data");
            info!("🌱 Seeded {} demo slots", slots);
            Arc::new(memory)
        }
    };

    // =========================================
    // STEP 4: Select Payment Gateway
    // =========================================
    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_secret_key {
        Some(key) => {
            let stripe = StripeGateway::new(
                &config.stripe_api_base,
                key,
                &config.stripe_webhook_secret,
            )
            .expect("Failed to create Stripe client");
            info!("💳 Stripe gateway at {}", config.stripe_api_base);
            Arc::new(stripe)
        }
        None => {
            warn!("💳 STRIPE_SECRET_KEY not set; using the mock gateway");
            Arc::new(MockGateway::new(&config.stripe_webhook_secret))
        }
    };

    // =========================================
    // STEP 5: Create Application State
    // =========================================
    let (dispatcher, notification_rx) = NotificationDispatcher::new(NOTIFICATION_QUEUE_CAPACITY);
    let app_state = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        gateway,
        dispatcher,
    ));

    info!("🔧 Services initialized");

    // =========================================
    // STEP 6: Start Background Services
    // =========================================
    tokio::spawn(run_worker(notification_rx, Arc::new(LogSink)));
    info!("📨 Notification worker started");

    let sweeper = ExpirySweeper::new(
        store,
        StdDuration::from_secs(config.payment_sweep_interval_secs),
        config.payment_sweep_grace(),
    );
    tokio::spawn(async move {
        sweeper.start().await;
    });
    info!("⏱️  Payment expiry sweeper started");

    // =========================================
    // STEP 7: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))

            // Add logging middleware
            .wrap(middleware::Logger::default())

            // Mobile and web clients call from other origins
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )

            // Configure API routes
            .configure(api::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await
}
