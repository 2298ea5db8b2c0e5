//! Engine configuration, built in code or loaded from the environment.

use std::env;

const DEFAULT_PREFIX: &str = "synq";
const DEFAULT_BATCH_SIZE: usize = 20;

/// Settings for opening a [`crate::Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynqConfig {
    /// Prefix for the engine's own tables
    pub prefix: String,
    /// Changes applied per savepoint
    pub batch_size: usize,
    /// Switch file databases to WAL journaling
    pub wal: bool,
    /// Fixed device id; generated and persisted on first open when unset
    pub device_id: Option<String>,
}

impl Default for SynqConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            wal: true,
            device_id: None,
        }
    }
}

impl SynqConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `TINYSYNQ_PREFIX`, `TINYSYNQ_BATCH_SIZE`, `TINYSYNQ_WAL` and
    /// `TINYSYNQ_DEVICE_ID`; anything unset keeps its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`SynqConfig::from_env`], after loading a `.env` file if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Build from any key lookup. Values are validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("TINYSYNQ_PREFIX") {
            config.prefix = prefix;
        }

        if let Some(raw) = lookup("TINYSYNQ_BATCH_SIZE") {
            config.batch_size = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidBatchSize(raw.clone()))?;
        }

        if let Some(raw) = lookup("TINYSYNQ_WAL") {
            config.wal = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidWal(raw)),
            };
        }

        config.device_id = lookup("TINYSYNQ_DEVICE_ID");

        config.validated()
    }

    /// Sanitise the prefix and check the remaining fields.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.prefix = sanitize_prefix(&self.prefix)?;
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size.to_string()));
        }
        if let Some(device_id) = &self.device_id {
            if device_id.trim().is_empty() {
                return Err(ConfigError::InvalidDeviceId);
            }
        }
        Ok(self)
    }
}

/// Trim the prefix and strip trailing non-alphanumerics; what remains must be
/// a plain identifier.
pub fn sanitize_prefix(prefix: &str) -> Result<String, ConfigError> {
    let sanitized = prefix
        .trim()
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());

    if crate::sql::is_identifier(sanitized) {
        Ok(sanitized.to_string())
    } else {
        Err(ConfigError::InvalidPrefix(prefix.to_string()))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid table prefix {0:?}: use letters, digits and underscores")]
    InvalidPrefix(String),

    #[error("invalid batch size {0:?}: must be a positive integer")]
    InvalidBatchSize(String),

    #[error("invalid TINYSYNQ_WAL value {0:?}")]
    InvalidWal(String),

    #[error("device id must not be empty")]
    InvalidDeviceId,
}
