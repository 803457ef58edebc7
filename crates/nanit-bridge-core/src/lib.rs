//! nanit-bridge core - connects Nanit cameras to a local RTMP ingest server.
//!
//! The bridge authenticates against the Nanit account API, keeps one control
//! channel open per camera to command it to push its stream to the local
//! ingest server, and reconciles the channel's view of each stream with the
//! publish/unpublish events the ingest server reports.

pub mod api;
pub mod auth;
pub mod bridge;
pub mod channel;
pub mod clock;
pub mod config;
pub mod reconciler;

#[cfg(test)]
mod test_support;

pub use bridge::{BridgeError, MediaKind, MediaSource, NanitBridge};
pub use config::Config;
