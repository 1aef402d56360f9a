//! Application configuration.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use autoclose_position::{LiquidationConfig, MonitorConfig};

use crate::error::{AppError, AppResult};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix for overrides (`AUTOCLOSE__MONITOR__HOLD_SECS`).
pub const ENV_PREFIX: &str = "AUTOCLOSE";

/// Close decision and timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Unrealized PnL (percent) that closes a position. Default: 2.0.
    #[serde(default = "default_target_profit_pct")]
    pub target_profit_pct: Decimal,
    /// Maximum holding time (seconds). Default: 180.
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
    /// Price cache lifetime (ms). Default: 2,000.
    #[serde(default = "default_price_cache_ttl_ms")]
    pub price_cache_ttl_ms: u64,
    /// PnL confirmation attempts per target hit. Default: 3.
    #[serde(default = "default_confirm_attempts")]
    pub confirm_attempts: u32,
    /// Linear backoff step between confirmation attempts (ms). Default: 500.
    #[serde(default = "default_confirm_backoff_ms")]
    pub confirm_backoff_ms: u64,
    /// Upper bound for a single exchange call (ms). Default: 5,000.
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    /// Full reconciliation interval (seconds). Default: 60.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Leverage recorded for positions opened without one. Default: 1.
    #[serde(default = "default_leverage")]
    pub default_leverage: Decimal,
}

fn default_target_profit_pct() -> Decimal {
    Decimal::TWO
}

fn default_hold_secs() -> u64 {
    180
}

fn default_price_cache_ttl_ms() -> u64 {
    2_000
}

fn default_confirm_attempts() -> u32 {
    3
}

fn default_confirm_backoff_ms() -> u64 {
    500
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            target_profit_pct: default_target_profit_pct(),
            hold_secs: default_hold_secs(),
            price_cache_ttl_ms: default_price_cache_ttl_ms(),
            confirm_attempts: default_confirm_attempts(),
            confirm_backoff_ms: default_confirm_backoff_ms(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_leverage: default_leverage(),
        }
    }
}

impl MonitorSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(cfg: &MonitorSection) -> Self {
        Self {
            target_profit_pct: cfg.target_profit_pct,
            hold: Duration::from_secs(cfg.hold_secs),
            price_cache_ttl: Duration::from_millis(cfg.price_cache_ttl_ms),
            confirm_attempts: cfg.confirm_attempts,
            confirm_backoff: Duration::from_millis(cfg.confirm_backoff_ms),
            exchange_timeout: Duration::from_millis(cfg.exchange_timeout_ms),
        }
    }
}

/// Forced-liquidation polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationSection {
    /// Whether the liquidation loop runs. Default: true.
    #[serde(default = "default_liquidation_enabled")]
    pub enabled: bool,
    /// Minimum time between two pulls (seconds). Default: 60.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Lookback window per pull (seconds). Default: 300.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Loop tick (seconds). Default: 30.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_liquidation_enabled() -> bool {
    true
}

fn default_min_interval_secs() -> u64 {
    60
}

fn default_lookback_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for LiquidationSection {
    fn default() -> Self {
        Self {
            enabled: default_liquidation_enabled(),
            min_interval_secs: default_min_interval_secs(),
            lookback_secs: default_lookback_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl LiquidationSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl From<&LiquidationSection> for LiquidationConfig {
    fn from(cfg: &LiquidationSection) -> Self {
        Self {
            min_interval: Duration::from_secs(cfg.min_interval_secs),
            lookback: Duration::from_secs(cfg.lookback_secs),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite file for the positions table.
    pub positions_db: String,
    /// SQLite file for the timers table.
    pub timers_db: String,
    /// Directory for the daily closed-position ledgers.
    pub ledger_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            positions_db: "./data/positions.db".to_string(),
            timers_db: "./data/timers.db".to_string(),
            ledger_dir: "./data/ledger".to_string(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Interval of the statistics summary written to the log (seconds).
    pub stats_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info,autoclose=debug".to_string(),
            stats_interval_secs: 3600,
        }
    }
}

impl TelemetryConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub liquidation: LiquidationSection,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load `path` (optional) with `AUTOCLOSE__*` environment overrides.
    pub fn load(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            tracing::warn!(path = %path, "Config file not found, using defaults and environment");
        }

        let config: Self = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AppError::Config(format!("Failed to load config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse TOML text.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let m = &self.monitor;
        if m.target_profit_pct <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "monitor.target_profit_pct must be positive, got {}",
                m.target_profit_pct
            )));
        }
        if m.hold_secs == 0 {
            return Err(AppError::Config("monitor.hold_secs must be > 0".to_string()));
        }
        if m.default_leverage < Decimal::ONE {
            return Err(AppError::Config(format!(
                "monitor.default_leverage must be >= 1, got {}",
                m.default_leverage
            )));
        }
        if m.confirm_attempts == 0 {
            return Err(AppError::Config(
                "monitor.confirm_attempts must be >= 1".to_string(),
            ));
        }
        if m.sweep_interval_secs == 0
            || self.liquidation.poll_interval_secs == 0
            || self.telemetry.stats_interval_secs == 0
        {
            return Err(AppError::Config("loop intervals must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::from(&self.monitor)
    }

    pub fn liquidation_config(&self) -> LiquidationConfig {
        LiquidationConfig::from(&self.liquidation)
    }
}
