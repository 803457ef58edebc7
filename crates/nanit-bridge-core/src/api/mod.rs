//! REST client module for the Nanit account service.
//!
//! This module provides the `AccountApi` seam and its `NanitClient`
//! implementation. Every call carries the `nanit-api-version: 1` header;
//! the baby list doubles as the lightweight probe used to verify a stored token.

pub mod client;
pub mod error;

pub use client::{AccountApi, Baby, LoginOutcome, NanitClient, TokenPair, DEFAULT_API_BASE_URL};
pub use error::ApiError;
