use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::ids::{AppId, DeviceId};
use crate::rewards::window::StackingPolicy;

/// Main rewards configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewardsConfig {
    /// Identity of the device running this instance
    pub device: DeviceConfig,

    /// Where ledger, window and audit files live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Point accrual for learning apps
    #[serde(default)]
    pub accrual: AccrualSettings,

    /// Point-to-time conversion
    #[serde(default)]
    pub redemption: RedemptionSettings,

    /// What happens when a redemption arrives during an active window
    #[serde(default)]
    pub stacking: StackingMode,

    /// Initial app classification rules
    #[serde(default)]
    pub apps: Vec<AppRule>,

    /// Retry behaviour for failed durable writes
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

/// Device identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Stable device identifier, also the sync tie-breaker
    pub id: DeviceId,

    /// Salt for deriving app ids from platform tokens
    #[serde(default = "default_generation")]
    pub generation: String,
}

fn default_generation() -> String {
    "1".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Data directory (platform default when absent)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Accrual policy for one app, or the global default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccrualConfig {
    pub points_per_minute: i64,
    pub daily_cap_points: i64,
    pub idle_timeout_seconds: i64,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            points_per_minute: 10,
            daily_cap_points: 600,
            idle_timeout_seconds: 120,
        }
    }
}

/// Accrual settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccrualSettings {
    #[serde(default)]
    pub default: AccrualConfig,

    /// Per-app overrides
    #[serde(default)]
    pub apps: BTreeMap<AppId, AccrualConfig>,
}

impl AccrualSettings {
    pub fn for_app(&self, app_id: &AppId) -> AccrualConfig {
        self.apps.get(app_id).copied().unwrap_or(self.default)
    }
}

/// Redemption policy for one reward app, or the global default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RedemptionConfig {
    /// Conversion ratio: points that buy one minute
    pub points_per_minute: i64,
    pub min_redemption_points: i64,
    pub max_redemption_points: i64,
    pub max_stacked_minutes: i64,
}

impl RedemptionConfig {
    /// Earned seconds for a number of points, rounded down.
    pub fn seconds_for_points(&self, points: i64) -> i64 {
        points.max(0) * 60 / self.points_per_minute
    }

    /// Largest number of points whose earned time fits in `seconds`.
    pub fn points_for_seconds(&self, seconds: i64) -> i64 {
        seconds.max(0) * self.points_per_minute / 60
    }
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            points_per_minute: 10,
            min_redemption_points: 10,
            max_redemption_points: 600,
            max_stacked_minutes: 120,
        }
    }
}

/// Redemption settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RedemptionSettings {
    #[serde(default)]
    pub default: RedemptionConfig,

    /// Per-reward-app overrides
    #[serde(default)]
    pub apps: BTreeMap<AppId, RedemptionConfig>,

    /// Which balance is drained first when a redemption spans several
    #[serde(default)]
    pub allocation_order: AllocationOrder,
}

impl RedemptionSettings {
    pub fn for_app(&self, app_id: Option<&AppId>) -> RedemptionConfig {
        app_id
            .and_then(|id| self.apps.get(id).copied())
            .unwrap_or(self.default)
    }
}

/// Order in which balances are drained by a redemption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOrder {
    /// Largest balance first; ties go to the global pool, then by app id
    #[default]
    LargestBalanceFirst,
    /// Global pool first, then apps by largest balance
    GlobalPoolFirst,
}

/// Stacking mode as written in the config file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StackingMode {
    Replace,
    #[default]
    Extend,
    Queue,
    Block,
}

/// App category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppCategory {
    /// Earns points while in the foreground
    Learning,
    /// Blocked unless an earned-time window is active
    Reward,
    /// Neither earns nor costs
    Neutral,
}

/// App classification entry in the config file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppRule {
    pub app_id: AppId,
    pub category: AppCategory,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Retry settings for durable writes
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PersistenceSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled on every attempt
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    200
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl RewardsConfig {
    /// Config with defaults for everything but the device id
    pub fn for_device(device_id: DeviceId) -> Self {
        Self {
            device: DeviceConfig {
                id: device_id,
                generation: default_generation(),
            },
            storage: StorageConfig::default(),
            accrual: AccrualSettings::default(),
            redemption: RedemptionSettings::default(),
            stacking: StackingMode::default(),
            apps: Vec::new(),
            persistence: PersistenceSettings::default(),
        }
    }

    /// Runtime stacking policy, with the cap taken from the default redemption config
    pub fn stacking_policy(&self) -> StackingPolicy {
        match self.stacking {
            StackingMode::Replace => StackingPolicy::Replace,
            StackingMode::Extend => StackingPolicy::Extend {
                cap_seconds: self.redemption.default.max_stacked_minutes * 60,
            },
            StackingMode::Queue => StackingPolicy::Queue,
            StackingMode::Block => StackingPolicy::Block,
        }
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}

/// Get the platform-specific config file path
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "screen-rewards")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("rewards-config.yaml"))
}

/// Get the platform-specific data directory
pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "screen-rewards")
        .context("Could not determine data directory")?;
    Ok(dirs.data_local_dir().to_path_buf())
}

/// Load configuration from YAML file
pub fn load_config(path: &Path) -> Result<RewardsConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RewardsConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Save configuration to YAML file
pub fn save_config(path: &Path, config: &RewardsConfig) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config)
        .context("Failed to serialize config to YAML")?;

    crate::platform::common::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &RewardsConfig) -> Result<()> {
    if config.device.id.as_str().is_empty() {
        anyhow::bail!("Device ID cannot be empty");
    }

    validate_accrual(&config.accrual.default).context("Invalid default accrual config")?;
    for (app_id, accrual) in &config.accrual.apps {
        validate_accrual(accrual)
            .with_context(|| format!("Invalid accrual config for app '{}'", app_id))?;
    }

    validate_redemption(&config.redemption.default)
        .context("Invalid default redemption config")?;
    for (app_id, redemption) in &config.redemption.apps {
        validate_redemption(redemption)
            .with_context(|| format!("Invalid redemption config for app '{}'", app_id))?;
    }

    let mut seen = HashSet::new();
    for rule in &config.apps {
        if rule.app_id.as_str().is_empty() {
            anyhow::bail!("App rule has an empty app_id");
        }
        if !seen.insert(&rule.app_id) {
            anyhow::bail!("Duplicate app rule: {}", rule.app_id);
        }
    }

    if config.persistence.retry_interval_ms == 0 && config.persistence.max_retries > 0 {
        anyhow::bail!("persistence.retry_interval_ms must be positive when retries are enabled");
    }

    Ok(())
}

fn validate_accrual(accrual: &AccrualConfig) -> Result<()> {
    if accrual.points_per_minute <= 0 {
        anyhow::bail!("points_per_minute must be positive");
    }
    if accrual.daily_cap_points < 0 {
        anyhow::bail!("daily_cap_points cannot be negative");
    }
    if accrual.idle_timeout_seconds <= 0 {
        anyhow::bail!("idle_timeout_seconds must be positive");
    }
    Ok(())
}

fn validate_redemption(redemption: &RedemptionConfig) -> Result<()> {
    if redemption.points_per_minute <= 0 {
        anyhow::bail!("points_per_minute must be positive");
    }
    if redemption.min_redemption_points <= 0 {
        anyhow::bail!("min_redemption_points must be positive");
    }
    if redemption.min_redemption_points > redemption.max_redemption_points {
        anyhow::bail!(
            "min_redemption_points ({}) exceeds max_redemption_points ({})",
            redemption.min_redemption_points,
            redemption.max_redemption_points
        );
    }
    if redemption.max_stacked_minutes <= 0 {
        anyhow::bail!("max_stacked_minutes must be positive");
    }
    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-rewards-config.yaml");
