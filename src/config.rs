//! Configuration loading and persistence.
//!
//! Settings come from `config.json` in the config directory, then from
//! `HERALD_*` environment variables. The VAPID keypair is never part of
//! `config.json`: it is read from `identity.json` beside it (written by
//! `herald keys generate --save`) or from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::notifications::dispatch::{DEFAULT_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TTL_SECS};
use crate::notifications::payload::NotificationDefaults;
use crate::notifications::vapid::{ServerIdentity, StoredIdentity, DEFAULT_SUBJECT};
use crate::notifications::ConfigError;

const CONFIG_FILE: &str = "config.json";
const IDENTITY_FILE: &str = "identity.json";
const STORE_FILE: &str = "subscriptions.json";

/// Which implementation encrypts payloads and signs assertions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// p256 / hkdf / aes-gcm.
    #[default]
    Native,
    /// The `web-push` crate.
    WebPush,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "web-push" | "webpush" => Ok(Self::WebPush),
            other => Err(ConfigError::InvalidValue {
                key: "backend",
                message: format!("unknown backend {other:?} (expected native or web-push)"),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::WebPush => "web-push",
        })
    }
}

/// Configuration for herald.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// VAPID public key (base64url) - NOT serialized to `config.json`.
    #[serde(skip)]
    pub vapid_public_key: Option<String>,
    /// VAPID private key (base64url) - NOT serialized to `config.json`.
    #[serde(skip)]
    pub vapid_private_key: Option<String>,
    /// Contact URI placed in the VAPID `sub` claim.
    pub subject: String,
    /// Seconds a push service may hold an undelivered message.
    pub ttl: u32,
    /// Maximum deliveries in flight.
    pub concurrency: usize,
    /// Per-request timeout in seconds.
    pub request_timeout: u64,
    /// Encryption / signing implementation.
    pub backend: Backend,
    /// Subscription store file; defaults to `subscriptions.json` in the
    /// config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Listen address for `herald serve`.
    pub bind: String,
    /// Notification defaults.
    pub notification: NotificationDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vapid_public_key: None,
            vapid_private_key: None,
            subject: DEFAULT_SUBJECT.to_string(),
            ttl: DEFAULT_TTL_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            backend: Backend::Native,
            store_path: None,
            bind: "127.0.0.1:8787".to_string(),
            notification: NotificationDefaults::default(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `HERALD_CONFIG_DIR` wins; otherwise the platform config dir
    /// (Linux: `~/.config/herald`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("HERALD_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("herald"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory with environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        Self::load_from(&dir, |key| std::env::var(key).ok())
    }

    /// Load from `dir`, resolving overrides through `lookup`.
    pub fn load_from(dir: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            Self::default()
        };

        let identity_path = dir.join(IDENTITY_FILE);
        if identity_path.exists() {
            let content = fs::read_to_string(&identity_path)
                .with_context(|| format!("Failed to read {}", identity_path.display()))?;
            let stored: StoredIdentity = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", identity_path.display()))?;
            config.vapid_public_key = Some(stored.public_key);
            config.vapid_private_key = Some(stored.private_key);
        }

        config.apply_overrides(lookup);
        if config.store_path.is_none() {
            config.store_path = Some(dir.join(STORE_FILE));
        }
        Ok(config)
    }

    /// Apply `HERALD_*` overrides. Unparseable numbers are logged and
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(public_key) = lookup("HERALD_VAPID_PUBLIC_KEY") {
            self.vapid_public_key = Some(public_key);
        }
        if let Some(private_key) = lookup("HERALD_VAPID_PRIVATE_KEY") {
            self.vapid_private_key = Some(private_key);
        }
        if let Some(subject) = lookup("HERALD_VAPID_SUBJECT") {
            self.subject = subject;
        }
        if let Some(path) = lookup("HERALD_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
        if let Some(bind) = lookup("HERALD_BIND") {
            self.bind = bind;
        }

        if let Some(ttl) = lookup("HERALD_TTL") {
            match ttl.parse::<u32>() {
                Ok(ttl) => self.ttl = ttl,
                Err(e) => log::warn!("Ignoring HERALD_TTL={ttl:?}: {e}"),
            }
        }
        if let Some(concurrency) = lookup("HERALD_CONCURRENCY") {
            match concurrency.parse::<usize>() {
                Ok(n) => self.concurrency = n,
                Err(e) => log::warn!("Ignoring HERALD_CONCURRENCY={concurrency:?}: {e}"),
            }
        }
        if let Some(timeout) = lookup("HERALD_REQUEST_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.request_timeout = secs,
                Err(e) => log::warn!("Ignoring HERALD_REQUEST_TIMEOUT={timeout:?}: {e}"),
            }
        }
        if let Some(backend) = lookup("HERALD_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => log::warn!("Ignoring HERALD_BACKEND: {e}"),
            }
        }
    }

    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "request_timeout",
                message: "must be at least 1 second".to_string(),
            });
        }
        if !(self.subject.starts_with("mailto:") || self.subject.starts_with("https:")) {
            return Err(ConfigError::InvalidValue {
                key: "subject",
                message: format!("{:?} is not a mailto: or https: URI", self.subject),
            });
        }
        Ok(())
    }

    /// Parse the configured VAPID keypair.
    ///
    /// Missing or malformed keys are fatal: nothing can be sent without them.
    pub fn identity(&self) -> Result<ServerIdentity, ConfigError> {
        match (&self.vapid_public_key, &self.vapid_private_key) {
            (Some(public_key), Some(private_key)) => {
                ServerIdentity::from_base64url(public_key, private_key)
            }
            (None, None) => Err(ConfigError::MissingIdentity),
            _ => Err(ConfigError::InvalidIdentity(
                "both the public and the private key are required".to_string(),
            )),
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Resolved subscription store path.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(STORE_FILE)),
        }
    }

    /// Persists the current configuration to disk.
    /// Note: keys are NOT saved here (use [`Config::save_identity`]).
    pub fn save(&self) -> Result<()> {
        Self::save_to(self, &Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Write `identity` to `identity.json` in the config directory.
    pub fn save_identity(identity: &ServerIdentity) -> Result<PathBuf> {
        let path = Self::config_dir()?.join(IDENTITY_FILE);
        Self::save_to(&identity.to_stored(), &path)?;
        log::info!("[Vapid] Saved server identity to {:?}", path);
        Ok(path)
    }

    fn save_to<T: Serialize>(value: &T, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}
