//! Bridge configuration management.
//!
//! This module handles loading and saving the bridge configuration: the
//! account email, the local ingest address, service endpoints and the
//! timing table used by the control channels and the reconciler.
//!
//! Configuration is stored at `~/.config/nanit-bridge/config.json`.
//! Environment variables override file values.

use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_API_BASE_URL;
use crate::auth::{CredentialStore, FileStore, KeyringStore};
use crate::channel::DEFAULT_CONTROL_BASE_URL;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "nanit-bridge";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default RTMP port of the local ingest server
pub const DEFAULT_INGEST_PORT: u16 = 1935;

/// Address used only to pick the outbound interface; nothing is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    File,
    Keyring,
}

/// Timers for channel supervision and stream reconciliation, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub stale_stream_secs: u64,
    pub sweep_interval_secs: u64,
    pub token_validity_secs: u64,
    pub pending_request_timeout_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_interval_secs: 20,
            reconnect_delay_secs: 30,
            stale_stream_secs: 120,
            sweep_interval_secs: 60,
            token_validity_secs: 4 * 60 * 60,
            pending_request_timeout_secs: 30,
        }
    }
}

impl Timings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn stale_stream_window(&self) -> Duration {
        Duration::from_secs(self.stale_stream_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    pub fn pending_request_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_request_timeout_secs)
    }
}

/// Where cameras are told to push their stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestTarget {
    pub host: String,
    pub port: u16,
}

impl IngestTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// `rtmp://<host>:<port>/live/<camera>`
    pub fn url_for(&self, camera: &str) -> String {
        format!("rtmp://{}:{}/live/{}", self.host, self.port, camera)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub email: Option<String>,
    /// Only ever read from the environment; never written to disk.
    #[serde(skip)]
    pub password: Option<String>,
    pub ingest_host: Option<String>,
    pub ingest_port: u16,
    pub api_base_url: String,
    pub control_base_url: String,
    pub credential_backend: CredentialBackend,
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            email: None,
            password: None,
            ingest_host: None,
            ingest_port: DEFAULT_INGEST_PORT,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            control_base_url: DEFAULT_CONTROL_BASE_URL.to_string(),
            credential_backend: CredentialBackend::default(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Load the config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(email) = lookup("NANIT_EMAIL") {
            self.email = Some(email);
        }
        if let Some(password) = lookup("NANIT_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(host) = lookup("NANIT_INGEST_HOST") {
            self.ingest_host = Some(host);
        }
        if let Some(port) = lookup("NANIT_INGEST_PORT") {
            self.ingest_port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid NANIT_INGEST_PORT: {}", port))?;
        }
        if let Some(url) = lookup("NANIT_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("NANIT_CONTROL_URL") {
            self.control_base_url = url;
        }
        Ok(())
    }

    /// Configured ingest address, or the host's primary outbound address.
    pub fn ingest_target(&self) -> Result<IngestTarget> {
        let host = match self.ingest_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => discover_ingest_host()?,
        };
        Ok(IngestTarget::new(&host, self.ingest_port))
    }

    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            CredentialBackend::Keyring => Arc::new(KeyringStore),
        })
    }
}

/// Local IPv4 address of the interface that routes to the internet.
pub fn discover_ingest_host() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind probe socket")?;
    socket
        .connect(ROUTE_PROBE_ADDR)
        .context("No route available to discover the ingest address")?;
    Ok(socket.local_addr()?.ip().to_string())
}
