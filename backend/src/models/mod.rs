//! # API Models
//!
//! This module defines the request and response structures for the REST API.
//! These are separate from database records so secrets (security tokens,
//! gateway ids) never leak into a response by accident.
//!
//! ## Organization
//!
//! - `requests.rs` - Incoming request bodies, each with `validate()`
//! - `responses.rs` - Outgoing response bodies and the `ApiResponse` envelope
//!
//! ## Serialization
//!
//! All models use Serde for JSON serialization/deserialization.
//! Field names are converted to camelCase for the mobile and web clients.
//! Amounts are integers in paise with a `formatted*` string alongside.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;

