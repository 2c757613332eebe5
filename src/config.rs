use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SentinelError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// One configured mailbox. Matches `models::Account` minus the database-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    #[serde(default = "default_provider_tag")]
    pub provider_tag: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: bool,
    pub username: String,
    /// Reference into the OS credential store / env var name; never a raw secret.
    pub credential_handle: String,
    #[serde(default = "default_target_folders")]
    pub target_folders: Vec<String>,
    pub batch_size_override: Option<u32>,
    pub confidence_threshold_override: Option<f64>,
    /// Sender domains this account's owner has told us to trust outright
    /// (e.g. their bank, employer, or a vendor they transact with). Tier 1's
    /// auth-bypass only fires for a domain in this list that also passes
    /// SPF/DKIM/DMARC; it never trusts a domain on reputation alone.
    #[serde(default)]
    pub trusted_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_tier1_threshold")]
    pub tier1_confidence_threshold: f64,
    #[serde(default = "default_tier3_threshold")]
    pub tier3_confidence_threshold: f64,
    #[serde(default = "default_tier3_budget_pct")]
    pub tier3_budget_pct: f64,
    #[serde(default = "default_tier3_timeout_secs")]
    pub tier3_timeout_secs: u64,
    #[serde(default = "default_taxonomy_v2_rollout_pct")]
    pub taxonomy_v2_rollout_pct: f64,
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Floor for `category_confidence * pattern_weight` below which the
    /// subcategory tagger withholds a subcategory rather than guessing.
    #[serde(default = "default_subcategory_confidence_floor")]
    pub subcategory_confidence_floor: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tier1_confidence_threshold: default_tier1_threshold(),
            tier3_confidence_threshold: default_tier3_threshold(),
            tier3_budget_pct: default_tier3_budget_pct(),
            tier3_timeout_secs: default_tier3_timeout_secs(),
            taxonomy_v2_rollout_pct: default_taxonomy_v2_rollout_pct(),
            model_dir: default_model_dir(),
            subcategory_confidence_floor: default_subcategory_confidence_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
    #[serde(default = "default_per_session_timeout_secs")]
    pub per_session_timeout_secs: u64,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
            per_session_timeout_secs: default_per_session_timeout_secs(),
            pid_file: default_pid_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            wal_mode: default_wal_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_breaker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_breaker_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

/// Per-provider IMAP tuning table, keyed by `provider_tag`. `generic` is the
/// fallback entry used when an account's tag has no specific row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_provider_profiles")]
    pub profiles: Vec<ProviderProfile>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            profiles: default_provider_profiles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub tag: String,
    pub folder_aliases: Vec<FolderAlias>,
    pub batch_size: u32,
    pub expunge_strategy: ExpungeStrategy,
    pub mark_seen: bool,
    pub default_confidence_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderAlias {
    pub canonical: String,
    pub provider_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpungeStrategy {
    BulkExpunge,
    PerUidExpunge,
}

impl ProvidersConfig {
    pub fn profile_for(&self, tag: &str) -> &ProviderProfile {
        self.profiles
            .iter()
            .find(|p| p.tag == tag)
            .unwrap_or_else(|| {
                self.profiles
                    .iter()
                    .find(|p| p.tag == "generic")
                    .expect("generic provider profile must always be present")
            })
    }
}

fn default_provider_tag() -> String {
    "generic".to_string()
}
fn default_imap_port() -> u16 {
    993
}
fn default_tls() -> bool {
    true
}
fn default_target_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}
fn default_tier1_threshold() -> f64 {
    0.70
}
fn default_tier3_threshold() -> f64 {
    0.70
}
fn default_tier3_budget_pct() -> f64 {
    1.0
}
fn default_tier3_timeout_secs() -> u64 {
    5
}
fn default_taxonomy_v2_rollout_pct() -> f64 {
    0.0
}
fn default_model_dir() -> String {
    "./models".to_string()
}
fn default_subcategory_confidence_floor() -> f64 {
    0.5
}
fn default_interval_minutes() -> u64 {
    30
}
fn default_max_concurrent_accounts() -> usize {
    4
}
fn default_per_session_timeout_secs() -> u64 {
    900
}
fn default_pid_file() -> String {
    "/tmp/sentinel-mail.pid".to_string()
}
fn default_db_path() -> String {
    "./sentinel.db".to_string()
}
fn default_wal_mode() -> bool {
    true
}
fn default_circuit_breaker_enabled() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_provider_profiles() -> Vec<ProviderProfile> {
    vec![
        ProviderProfile {
            tag: "gmail".to_string(),
            folder_aliases: vec![
                FolderAlias {
                    canonical: "INBOX".to_string(),
                    provider_name: "INBOX".to_string(),
                },
                FolderAlias {
                    canonical: "ALL".to_string(),
                    provider_name: "[Gmail]/All Mail".to_string(),
                },
                FolderAlias {
                    canonical: "TRASH".to_string(),
                    provider_name: "[Gmail]/Trash".to_string(),
                },
            ],
            batch_size: 200,
            expunge_strategy: ExpungeStrategy::BulkExpunge,
            mark_seen: false,
            default_confidence_threshold: 0.85,
        },
        ProviderProfile {
            tag: "icloud".to_string(),
            folder_aliases: vec![
                FolderAlias {
                    canonical: "INBOX".to_string(),
                    provider_name: "INBOX".to_string(),
                },
                FolderAlias {
                    canonical: "TRASH".to_string(),
                    provider_name: "Deleted Messages".to_string(),
                },
            ],
            batch_size: 50,
            expunge_strategy: ExpungeStrategy::PerUidExpunge,
            mark_seen: true,
            default_confidence_threshold: 0.80,
        },
        ProviderProfile {
            tag: "outlook".to_string(),
            folder_aliases: vec![
                FolderAlias {
                    canonical: "INBOX".to_string(),
                    provider_name: "INBOX".to_string(),
                },
                FolderAlias {
                    canonical: "TRASH".to_string(),
                    provider_name: "Deleted Items".to_string(),
                },
            ],
            batch_size: 100,
            expunge_strategy: ExpungeStrategy::BulkExpunge,
            mark_seen: false,
            default_confidence_threshold: 0.75,
        },
        ProviderProfile {
            tag: "generic".to_string(),
            folder_aliases: vec![
                FolderAlias {
                    canonical: "INBOX".to_string(),
                    provider_name: "INBOX".to_string(),
                },
                FolderAlias {
                    canonical: "TRASH".to_string(),
                    provider_name: "Trash".to_string(),
                },
            ],
            batch_size: 50,
            expunge_strategy: ExpungeStrategy::PerUidExpunge,
            mark_seen: true,
            default_confidence_threshold: 0.75,
        },
    ]
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SentinelError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| SentinelError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SentinelError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SentinelError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| SentinelError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values. Fatal at startup; never mid-session.
    pub fn validate(&self) -> Result<()> {
        for account in &self.accounts {
            if account.email.is_empty() {
                return Err(SentinelError::ConfigError(
                    "account email cannot be empty".to_string(),
                ));
            }
            if account.host.is_empty() {
                return Err(SentinelError::ConfigError(format!(
                    "account {} is missing an IMAP host",
                    account.email
                )));
            }
            if let Some(t) = account.confidence_threshold_override {
                if !(0.0..=1.0).contains(&t) {
                    return Err(SentinelError::ConfigError(format!(
                        "account {} confidence_threshold_override must be in [0.0, 1.0]",
                        account.email
                    )));
                }
            }
        }

        if !(0.0..=1.0).contains(&self.classifier.tier1_confidence_threshold) {
            return Err(SentinelError::ConfigError(
                "classifier.tier1_confidence_threshold must be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.tier3_confidence_threshold) {
            return Err(SentinelError::ConfigError(
                "classifier.tier3_confidence_threshold must be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.tier3_budget_pct) {
            return Err(SentinelError::ConfigError(
                "classifier.tier3_budget_pct must be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.taxonomy_v2_rollout_pct) {
            return Err(SentinelError::ConfigError(
                "classifier.taxonomy_v2_rollout_pct must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.classifier.tier3_timeout_secs == 0 {
            return Err(SentinelError::ConfigError(
                "classifier.tier3_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.subcategory_confidence_floor) {
            return Err(SentinelError::ConfigError(
                "classifier.subcategory_confidence_floor must be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.scheduler.max_concurrent_accounts == 0 {
            return Err(SentinelError::ConfigError(
                "scheduler.max_concurrent_accounts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_minutes == 0 {
            return Err(SentinelError::ConfigError(
                "scheduler.interval_minutes must be at least 1".to_string(),
            ));
        }

        if self.persistence.db_path.is_empty() {
            return Err(SentinelError::ConfigError(
                "persistence.db_path cannot be empty".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(SentinelError::ConfigError(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout_secs == 0 {
            return Err(SentinelError::ConfigError(
                "circuit_breaker.reset_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.providers.profiles.iter().all(|p| p.tag != "generic") {
            return Err(SentinelError::ConfigError(
                "providers.profiles must include a 'generic' fallback profile".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
