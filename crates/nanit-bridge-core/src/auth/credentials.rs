use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "nanit-bridge";

/// Credentials file name in the cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Fields kept in durable credential storage. The MFA challenge token is
/// deliberately absent: it only lives in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Email,
    Password,
    AccessToken,
    RefreshToken,
    /// Access token expiry, epoch milliseconds
    Expiration,
}

impl CredentialKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::Email => "email",
            CredentialKey::Password => "password",
            CredentialKey::AccessToken => "access_token",
            CredentialKey::RefreshToken => "refresh_token",
            CredentialKey::Expiration => "expiration",
        }
    }
}

/// Durable key/value persistence for account credentials and tokens.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Result<Option<String>>;
    fn put(&self, key: CredentialKey, value: &str) -> Result<()>;
    fn delete(&self, key: CredentialKey) -> Result<()>;
}

// ============================================================================
// OS keychain
// ============================================================================

/// Stores each credential as its own entry in the OS keychain.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl KeyringStore {
    fn entry(key: CredentialKey) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key.as_str()).context("Failed to create keyring entry")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        Self::entry(key)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn delete(&self, key: CredentialKey) -> Result<()> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

// ============================================================================
// JSON file
// ============================================================================

/// Stores credentials as a JSON object in the cache directory.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, contents).context("Failed to write credentials file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("credentials file lock poisoned"))?;
        let mut values = self.load()?;
        apply(&mut values);
        self.save(&values)
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("credentials file lock poisoned"))?;
        Ok(self.load()?.remove(key.as_str()))
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn delete(&self, key: CredentialKey) -> Result<()> {
        self.update(|values| {
            values.remove(key.as_str());
        })
    }
}

// ============================================================================
// In memory
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with email and password, the minimum needed to log in
    pub fn with_login(email: &str, password: &str) -> Self {
        let mut values = HashMap::new();
        values.insert(CredentialKey::Email, email.to_string());
        values.insert(CredentialKey::Password, password.to_string());
        Self {
            values: Mutex::new(values),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))?;
        Ok(values.get(&key).cloned())
    }

    fn put(&self, key: CredentialKey, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))?
            .insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: CredentialKey) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("credential store lock poisoned"))?
            .remove(&key);
        Ok(())
    }
}
