//! Client configuration

use crate::{ClientError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use synapse_storage::{Metadata, StorageOptions, UploadSettings, DEFAULT_COPIES};

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "SYNAPSE_CONFIG";

/// Prefix of environment overrides (`SYNAPSE_COPIES`, `SYNAPSE_WITH_CDN`, ...)
pub const ENV_PREFIX: &str = "SYNAPSE";

/// Client configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Chain RPC endpoint, used as a label for the chain access in use
    pub rpc_url: String,
    /// Batching, polling and replacement settings
    pub upload: UploadSettings,
    /// Copies per multi-copy upload
    pub copies: usize,
    /// Ask for CDN-enabled data sets and retrieval by default
    pub with_cdn: bool,
    /// Domain of the CDN retrieval service
    pub cdn_domain: Option<String>,
    /// Data set metadata applied to every request
    pub metadata: Metadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.calibration.node.glif.io/rpc/v1".to_string(),
            upload: UploadSettings::default(),
            copies: DEFAULT_COPIES,
            with_cdn: false,
            cdn_domain: None,
            metadata: Metadata::new(),
        }
    }
}

impl Config {
    /// Create a new config with the given RPC endpoint
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ..Default::default()
        }
    }

    /// Set upload settings
    pub fn with_upload_settings(mut self, upload: UploadSettings) -> Self {
        self.upload = upload;
        self
    }

    /// Set the copy count
    pub fn with_copies(mut self, copies: usize) -> Self {
        self.copies = copies;
        self
    }

    /// Enable CDN
    pub fn with_cdn(mut self, domain: impl Into<String>) -> Self {
        self.with_cdn = true;
        self.cdn_domain = Some(domain.into());
        self
    }

    /// Add a default metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Load `.env`, then the file named by `SYNAPSE_CONFIG`, then
    /// `SYNAPSE_*` variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load(file.as_deref().map(Path::new), None)
    }

    /// Layer defaults, an optional file and environment overrides
    ///
    /// `vars` replaces the process environment when given.
    pub fn load(file: Option<&Path>, vars: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(vars);

        let raw: RawConfig = builder.add_source(environment).build()?.try_deserialize()?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no upload could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.copies == 0 {
            return Err(ClientError::Config("copies must be at least 1".to_string()));
        }
        if self.upload.upload_batch_size == 0 {
            return Err(ClientError::Config("upload batch size must be at least 1".to_string()));
        }
        if self.with_cdn && self.cdn_domain.as_deref().map_or(true, str::is_empty) {
            return Err(ClientError::Config("with_cdn requires a cdn_domain".to_string()));
        }
        Ok(())
    }

    /// Manager-level option defaults derived from this config
    pub fn storage_defaults(&self) -> StorageOptions {
        StorageOptions {
            count: Some(self.copies),
            // Left unset when off so CDN can still be inferred from metadata
            with_cdn: self.with_cdn.then_some(true),
            metadata: self.metadata.clone(),
            ..Default::default()
        }
    }
}

/// Flat on-disk / environment shape of [`Config`]
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    rpc_url: String,
    copies: usize,
    with_cdn: bool,
    cdn_domain: Option<String>,
    metadata: Metadata,
    upload_batch_size: usize,
    park_timeout_secs: u64,
    park_poll_interval_secs: u64,
    batch_wait_max_secs: u64,
    pull_timeout_secs: u64,
    pull_poll_interval_secs: u64,
    max_replacement_attempts: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        let config = Config::default();
        let upload = &config.upload;
        Self {
            upload_batch_size: upload.upload_batch_size,
            park_timeout_secs: upload.park_timeout.as_secs(),
            park_poll_interval_secs: upload.park_poll_interval.as_secs(),
            batch_wait_max_secs: upload.batch_wait_max.as_secs(),
            pull_timeout_secs: upload.pull_timeout.as_secs(),
            pull_poll_interval_secs: upload.pull_poll_interval.as_secs(),
            max_replacement_attempts: upload.max_replacement_attempts,
            rpc_url: config.rpc_url,
            copies: config.copies,
            with_cdn: config.with_cdn,
            cdn_domain: config.cdn_domain,
            metadata: config.metadata,
        }
    }
}

impl RawConfig {
    fn into_config(self) -> Config {
        let defaults = UploadSettings::default();
        let upload = UploadSettings {
            upload_batch_size: self.upload_batch_size,
            park_timeout: Duration::from_secs(self.park_timeout_secs),
            park_poll_interval: Duration::from_secs(self.park_poll_interval_secs),
            batch_wait_max: Duration::from_secs(self.batch_wait_max_secs),
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
            pull_poll_interval: Duration::from_secs(self.pull_poll_interval_secs),
            ..defaults
        }
        .with_max_replacement_attempts(self.max_replacement_attempts);

        Config {
            rpc_url: self.rpc_url,
            upload,
            copies: self.copies,
            with_cdn: self.with_cdn,
            cdn_domain: self.cdn_domain.filter(|d| !d.is_empty()),
            metadata: self.metadata,
        }
    }
}
