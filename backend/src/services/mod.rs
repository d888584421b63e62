//! # Services Module
//!
//! This module contains the core business logic of the booking backend.
//! State machines are pure functions over records the store has locked;
//! the managers wire them to the store, the gateway and notifications.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `slot_capacity` | Atomic reserve/release of slot units |
//! | `booking_lifecycle` | Booking state machine |
//! | `payment_lifecycle` | Payment state machine, QR integrity, attempt tracking |
//! | `lockout` | Shared lock-at-threshold policy |
//! | `BookingService` | Booking create, cancel and admin transitions |
//! | `PaymentService` | Payment create, confirm, refund, webhooks, admin tools |
//! | `OtpService` | OTP send/verify, login lockout |
//! | `ExpirySweeper` | Expires stale pending payments |
//! | `gateway` | Card processor adapter (Stripe, mock) |
//! | `notifications` | Fire-and-forget SMS / email queue |
//! | `session` | Bearer credential issuer |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │BookingService│   │PaymentService│   │  OtpService  │         │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘         │
//! │         │                  │    │             │                  │
//! │         ▼                  ▼    ▼             ▼                  │
//! │  ┌─────────────┐   ┌─────────────┐  ┌─────────┐  ┌──────────┐   │
//! │  │  booking_   │◄──│  payment_   │  │ gateway │  │ session  │   │
//! │  │  lifecycle  │   │  lifecycle  │  └─────────┘  └──────────┘   │
//! │  └──────┬──────┘   └──────┬──────┘                              │
//! │         ▼                 ▼                                      │
//! │  ┌─────────────┐   ┌─────────────┐      ┌──────────────────┐    │
//! │  │slot_capacity│   │   lockout   │      │  notifications   │    │
//! │  └─────────────┘   └─────────────┘      └──────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod booking_lifecycle;
pub mod booking_manager;
pub mod error;
pub mod expiry_sweeper;
pub mod gateway;
pub mod lockout;
pub mod notifications;
pub mod otp;
pub mod payment_lifecycle;
pub mod payment_manager;
pub mod session;
pub mod slot_capacity;

pub use booking_manager::BookingService;
pub use error::{FieldError, ServiceError};
pub use expiry_sweeper::ExpirySweeper;
pub use gateway::{MockGateway, PaymentGateway, StripeGateway};
pub use notifications::NotificationDispatcher;
pub use otp::OtpService;
pub use payment_lifecycle::PaymentPolicy;
pub use payment_manager::PaymentService;
pub use session::{InMemorySessionIssuer, SessionIssuer};
