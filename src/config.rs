//! Production configuration system
//!
//! Provides centralized configuration management with:
//! - Environment variable support
//! - Config file loading (optional)
//! - Runtime defaults
//! - Validation and type safety

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Placeholder replaced by the shard letter in host and prefix templates.
pub const SHARD_PLACEHOLDER: &str = "{shard}";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Worker pool and batching configuration
    pub processing: ProcessingConfig,

    /// Storage instances and namespaces
    pub storage: StorageConfig,

    /// Identity directory configuration
    pub directory: DirectoryConfig,

    /// Charge API and billing receiver
    pub billing: BillingConfig,

    /// Archive destination
    pub archive: ArchiveConfig,

    /// Paths configuration
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub identity_concurrency: usize,
    pub charge_concurrency: usize,
    pub charge_chunk_size: usize,
    pub progress_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub eos_binary: String,
    pub shards: String,
    pub project_host_template: String,
    pub project_prefix: String,
    pub home_host_template: String,
    pub home_prefix: String,
    pub list_timeout_secs: u64,
    pub quota_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub getent_binary: String,
    pub ldapsearch_binary: String,
    pub ldap_uri: String,
    pub base_dn: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub charge_api_url: String,
    pub receiver_prod_url: String,
    pub receiver_dev_url: String,
    pub receiver_api_key: String,
    pub from_charge_group: String,
    pub accounting_doc: String,
    pub project_label: String,
    pub currency: String,
    pub cost_per_tb: f64,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub host: String,
    pub directory: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub output_directory: PathBuf,
    pub log_directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARN".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            identity_concurrency: 200,
            charge_concurrency: 1,
            charge_chunk_size: 1000,
            progress_interval: 500,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            eos_binary: "eos".to_string(),
            shards: "abcdefghijklmnopqrstuvwxyz".to_string(),
            project_host_template: "root://eosproject-{shard}.cern.ch".to_string(),
            project_prefix: "/eos/project/".to_string(),
            home_host_template: "root://eoshome-{shard}.cern.ch".to_string(),
            home_prefix: "/eos/user/".to_string(),
            list_timeout_secs: 30,
            quota_timeout_secs: 60,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            getent_binary: "getent".to_string(),
            ldapsearch_binary: "ldapsearch".to_string(),
            ldap_uri: "ldap://xldap.cern.ch:389".to_string(),
            base_dn: "OU=Users,OU=Organic Units,DC=cern,DC=ch".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            charge_api_url: "https://accounting-receiver.cern.ch/v2/".to_string(),
            receiver_prod_url: "https://acc-receiver.cern.ch/v3/fe".to_string(),
            receiver_dev_url: "https://acc-receiver-dev.cern.ch/v3/fe".to_string(),
            receiver_api_key: String::new(),
            from_charge_group: "CERNBox".to_string(),
            accounting_doc: "CERNBox accounts on actually-used space in EOS".to_string(),
            project_label: "CERNBox".to_string(),
            currency: "CHF".to_string(),
            cost_per_tb: 2.20,
            http_timeout_secs: 60,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            host: "root://eosproject-f.cern.ch".to_string(),
            directory: "/eos/project/f/fdo/www/accounting/data/cernbox/".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("."),
            log_directory: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load configuration from environment, file, and defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                info!(config_file = %path.display(), "Loading configuration from file");
                Self::load_from_file(path)?
            }
            None => Self::discover()?,
        };

        // Override with environment variables
        config.apply_env_overrides()?;

        config.validate()?;

        Ok(config)
    }

    fn discover() -> Result<Self> {
        let config_paths = [
            PathBuf::from("storage-accounting.toml"),
            PathBuf::from(".storage-accounting.toml"),
            dirs::config_dir()
                .map(|d| d.join("storage-accounting").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.is_file() {
                info!(config_file = %path.display(), "Loading configuration from file");
                return Self::load_from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Logging overrides
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        // Processing overrides
        if let Ok(val) = env::var("ACCOUNTING_IDENTITY_CONCURRENCY") {
            self.processing.identity_concurrency = val
                .parse()
                .context("Invalid ACCOUNTING_IDENTITY_CONCURRENCY")?;
        }
        if let Ok(val) = env::var("ACCOUNTING_CHARGE_CHUNK_SIZE") {
            self.processing.charge_chunk_size =
                val.parse().context("Invalid ACCOUNTING_CHARGE_CHUNK_SIZE")?;
        }

        // External services
        if let Ok(val) = env::var("ACCOUNTING_EOS_BINARY") {
            self.storage.eos_binary = val;
        }
        if let Ok(val) = env::var("ACCOUNTING_LDAP_URI") {
            self.directory.ldap_uri = val;
        }
        if let Ok(val) = env::var("ACCOUNTING_CHARGE_API_URL") {
            self.billing.charge_api_url = val;
        }
        if let Ok(val) = env::var("ACCOUNTING_RECEIVER_API_KEY") {
            self.billing.receiver_api_key = val;
        }
        if let Ok(val) = env::var("ACCOUNTING_COST_PER_TB") {
            self.billing.cost_per_tb = val.parse().context("Invalid ACCOUNTING_COST_PER_TB")?;
        }

        // Path overrides
        if let Ok(val) = env::var("ACCOUNTING_OUTPUT_DIR") {
            self.paths.output_directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("ACCOUNTING_LOG_DIR") {
            self.paths.log_directory = PathBuf::from(val);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.processing.identity_concurrency == 0 {
            return Err(anyhow::anyhow!("Identity concurrency must be greater than 0"));
        }

        if self.processing.charge_concurrency == 0 {
            return Err(anyhow::anyhow!("Charge concurrency must be greater than 0"));
        }

        if self.processing.charge_concurrency > 1 {
            warn!(
                charge_concurrency = self.processing.charge_concurrency,
                "Charge API is shared and rate-sensitive, more than one request in flight is not recommended"
            );
        }

        if self.processing.charge_chunk_size == 0 {
            return Err(anyhow::anyhow!("Charge chunk size must be greater than 0"));
        }

        if !self.billing.cost_per_tb.is_finite() || self.billing.cost_per_tb < 0.0 {
            return Err(anyhow::anyhow!(
                "Cost per TB must be a non-negative number, got {}",
                self.billing.cost_per_tb
            ));
        }

        for (name, template) in [
            ("project_host_template", &self.storage.project_host_template),
            ("home_host_template", &self.storage.home_host_template),
        ] {
            if !template.contains(SHARD_PLACEHOLDER) {
                return Err(anyhow::anyhow!(
                    "storage.{} must contain {}, got {}",
                    name,
                    SHARD_PLACEHOLDER,
                    template
                ));
            }
        }

        if self.storage.shards.is_empty() {
            return Err(anyhow::anyhow!("storage.shards cannot be empty"));
        }

        Ok(())
    }

    /// Save current configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");

        Ok(())
    }
}

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the configuration loaded by the binary. Later calls keep the first value.
pub fn init_config(config: Config) -> &'static Config {
    CONFIG.get_or_init(|| config)
}
