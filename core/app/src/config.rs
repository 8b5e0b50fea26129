//! Mirror configuration file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use pcemirror_common::{Error, Result};
use pcemirror_jobs::PollConfig;
use pcemirror_remote::{Credentials, PceContext, RetryConfig, DEFAULT_PAGE_SIZE};

/// Connection settings of one PCE organization.
#[derive(Clone, Serialize, Deserialize)]
pub struct PceSettings {
    pub base_url: String,
    #[serde(default = "default_org_id")]
    pub org_id: u32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_org_id() -> u32 {
    1
}

fn default_verify_tls() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for PceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8443".to_string(),
            org_id: default_org_id(),
            api_key: None,
            api_secret: None,
            csrf_token: None,
            session_cookie: None,
            verify_tls: default_verify_tls(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl fmt::Debug for PceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PceSettings")
            .field("base_url", &self.base_url)
            .field("org_id", &self.org_id)
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .field(
                "session_cookie",
                &self.session_cookie.as_ref().map(|_| "<redacted>"),
            )
            .field("verify_tls", &self.verify_tls)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl PceSettings {
    /// Credentials described by the settings.
    ///
    /// An API key pair wins over a session; with neither, requests are sent
    /// unauthenticated.
    ///
    /// # Errors
    /// - `Config` if only half of a pair is present
    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => {
                return Ok(Credentials::ApiKey {
                    key: key.clone(),
                    secret: Zeroizing::new(secret.clone()),
                })
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Config(
                    "api_key and api_secret must be set together".to_string(),
                ))
            }
            (None, None) => {}
        }

        match (&self.csrf_token, &self.session_cookie) {
            (Some(csrf), Some(cookie)) => Ok(Credentials::Session {
                csrf_token: Zeroizing::new(csrf.clone()),
                session_cookie: Zeroizing::new(cookie.clone()),
            }),
            (None, None) => Ok(Credentials::Anonymous),
            _ => Err(Error::Config(
                "csrf_token and session_cookie must be set together".to_string(),
            )),
        }
    }

    /// Build the connection context.
    pub fn context(&self) -> Result<PceContext> {
        Ok(PceContext::new(&self.base_url, self.org_id, self.credentials()?)?
            .with_verify_tls(self.verify_tls)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_page_size(self.page_size))
    }
}

/// Retry policy for idempotent remote reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    /// Executor configuration for the HTTP client.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub pce: PceSettings,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

/// Per-user data directory of the mirror.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pcemirror")
}

fn default_database_path() -> PathBuf {
    data_dir().join("mirror.db")
}

fn default_export_dir() -> PathBuf {
    data_dir().join("exports")
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            pce: PceSettings::default(),
            database_path: default_database_path(),
            poll: PollConfig::default(),
            retry: RetrySettings::default(),
            export_dir: default_export_dir(),
        }
    }
}

impl MirrorConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check the settings without contacting the PCE.
    ///
    /// # Errors
    /// - `Config` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        self.pce.context()?;
        if self.pce.org_id == 0 {
            return Err(Error::Config("org_id must be positive".to_string()));
        }
        if self.pce.page_size == 0 {
            return Err(Error::Config("page_size must be positive".to_string()));
        }
        if self.pce.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".to_string()));
        }
        if self.poll.max_wait.is_zero() {
            return Err(Error::Config("poll.max_wait must be positive".to_string()));
        }
        if self.poll.backoff.initial_delay.is_zero() {
            return Err(Error::Config(
                "poll.backoff.initial_delay must be positive".to_string(),
            ));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path cannot be empty".to_string()));
        }
        Ok(())
    }
}
