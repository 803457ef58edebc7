//! Authentication module for the account session and its credentials.
//!
//! This module provides:
//! - `AuthSession`: token lifecycle (verify, refresh, login, MFA continuation)
//! - `CredentialStore`: durable credential storage (OS keychain, JSON file, memory)
//!
//! Access tokens are assumed valid for 4 hours after they are issued.

pub mod credentials;
pub mod session;

pub use credentials::{CredentialKey, CredentialStore, FileStore, KeyringStore, MemoryStore};
pub use session::{AuthError, AuthOutcome, AuthSession, AuthState, Credential};
