// =============================================================================
// Runtime Configuration — hot-reloadable core-runtime settings with atomic save
// =============================================================================
//
// Every tunable named in spec §6's environment-variable table lives here so
// the admission gates, auto-heal breaker, and health aggregator can be
// reconfigured without a restart.
//
// Persistence uses the same atomic tmp + rename pattern as the rest of the
// SSOT bus. All fields carry `#[serde(default)]` so that adding a new field
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::admission::{PositionConflictPolicy, RiskLimits};
use crate::autoheal::GlobalBreakerThresholds;

fn default_max_position_usdt() -> f64 {
    1000.0
}

fn default_max_total_exposure_usdt() -> f64 {
    5000.0
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_daily_pnl_loss_threshold() -> f64 {
    -1000.0
}

fn default_balance_shortfall_threshold() -> f64 {
    -500.0
}

fn default_ws_failure_count_threshold() -> u32 {
    10
}

fn default_feeder_ttl() -> f64 {
    30.0
}

fn default_trader_ttl() -> f64 {
    300.0
}

fn default_ares_ttl() -> f64 {
    75.0
}

fn default_dedupe_window_secs() -> f64 {
    300.0
}

fn default_position_conflict_policy() -> PositionConflictPolicy {
    PositionConflictPolicy::AllowNetting
}

/// Config-file mirror of [`crate::admission::RiskLimits`]. Kept as a
/// separate serde-friendly struct rather than deriving `Serialize` directly
/// on the gates' type, so the gate module stays free of persistence
/// concerns (spec §9: gates are pure functions).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    #[serde(default = "default_max_position_usdt")]
    pub max_position_usdt: f64,
    #[serde(default = "default_max_total_exposure_usdt")]
    pub max_total_exposure_usdt: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_position_usdt: default_max_position_usdt(),
            max_total_exposure_usdt: default_max_total_exposure_usdt(),
        }
    }
}

impl From<RiskLimitsConfig> for RiskLimits {
    fn from(cfg: RiskLimitsConfig) -> Self {
        RiskLimits {
            max_position_usdt: cfg.max_position_usdt,
            max_total_exposure_usdt: cfg.max_total_exposure_usdt,
        }
    }
}

/// Config-file mirror of [`crate::autoheal::GlobalBreakerThresholds`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerThresholdsConfig {
    #[serde(default = "default_daily_pnl_loss_threshold")]
    pub daily_pnl_loss: f64,
    #[serde(default = "default_balance_shortfall_threshold")]
    pub balance_shortfall: f64,
    #[serde(default = "default_ws_failure_count_threshold")]
    pub ws_failure_count: u32,
}

impl Default for BreakerThresholdsConfig {
    fn default() -> Self {
        Self {
            daily_pnl_loss: default_daily_pnl_loss_threshold(),
            balance_shortfall: default_balance_shortfall_threshold(),
            ws_failure_count: default_ws_failure_count_threshold(),
        }
    }
}

impl From<BreakerThresholdsConfig> for GlobalBreakerThresholds {
    fn from(cfg: BreakerThresholdsConfig) -> Self {
        GlobalBreakerThresholds {
            daily_pnl_loss: cfg.daily_pnl_loss,
            balance_shortfall: cfg.balance_shortfall,
            ws_failure_count: cfg.ws_failure_count,
        }
    }
}

/// Per-service freshness thresholds, mirroring
/// [`crate::health::DEFAULT_FRESHNESS_THRESHOLDS`] but overridable from the
/// `FEEDER_TTL`/`TRADER_TTL`/`ARES_TTL` env vars (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_feeder_ttl")]
    pub feeder_ttl: f64,
    #[serde(default = "default_trader_ttl")]
    pub trader_ttl: f64,
    #[serde(default = "default_ares_ttl")]
    pub ares_ttl: f64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            feeder_ttl: default_feeder_ttl(),
            trader_ttl: default_trader_ttl(),
            ares_ttl: default_ares_ttl(),
        }
    }
}

/// The full set of core-runtime tunables, loaded once at startup and
/// reloadable on a `SIGHUP`-equivalent signal (spec §6 — reload is driven by
/// rewriting this file, which the filesystem watcher picks up like any
/// other bus artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Truthy value drops every signal at gate G6 (spec §6 `DRY_RUN`).
    #[serde(default)]
    pub dry_run: bool,
    /// Same effect as `dry_run`; kept distinct because both env vars are
    /// independently recorded in admission evidence (spec §6
    /// `SIMULATION_MODE`).
    #[serde(default)]
    pub simulation_mode: bool,

    #[serde(default)]
    pub risk_limits: RiskLimitsConfig,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default)]
    pub position_conflict_policy_is_drop_on_conflict: bool,

    #[serde(default)]
    pub breaker_thresholds: BreakerThresholdsConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,

    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            simulation_mode: false,
            risk_limits: RiskLimitsConfig::default(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            position_conflict_policy_is_drop_on_conflict: false,
            breaker_thresholds: BreakerThresholdsConfig::default(),
            freshness: FreshnessConfig::default(),
            dedupe_window_secs: default_dedupe_window_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `path`, falling back to defaults (and logging a warning)
    /// when the file is missing or unparsable, so a fresh repo root can
    /// start without hand-authoring a config file first.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "runtime config not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config at {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse runtime config, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Persist via the atomic tmp+rename idiom used by the rest of the SSOT
    /// bus, so a crash mid-write never leaves a truncated config file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("failed to serialize runtime config")?;
        crate::fs_bus::write_atomic(path, &bytes)
    }

    pub fn position_conflict_policy(&self) -> PositionConflictPolicy {
        if self.position_conflict_policy_is_drop_on_conflict {
            PositionConflictPolicy::DropOnConflict
        } else {
            default_position_conflict_policy()
        }
    }

    /// Whether admission gate G6 should drop every signal (spec §6:
    /// `DRY_RUN` and `SIMULATION_MODE` have the same effect).
    pub fn simulation_guard_active(&self) -> bool {
        self.dry_run || self.simulation_mode
    }

    pub fn risk_limits(&self) -> RiskLimits {
        self.risk_limits.into()
    }

    pub fn breaker_thresholds(&self) -> GlobalBreakerThresholds {
        self.breaker_thresholds.into()
    }

    /// Apply the env-var overrides named in spec §6, taking precedence over
    /// whatever was loaded from disk.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DRY_RUN") {
            self.dry_run = is_truthy(&v);
        }
        if let Ok(v) = std::env::var("SIMULATION_MODE") {
            self.simulation_mode = is_truthy(&v);
        }
        if let Some(v) = parse_env_f64("MAX_POSITION_USDT") {
            self.risk_limits.max_position_usdt = v;
        }
        if let Some(v) = parse_env_f64("MAX_TOTAL_EXPOSURE_USDT") {
            self.risk_limits.max_total_exposure_usdt = v;
        }
        if let Some(v) = parse_env_f64("MAX_DAILY_LOSS_PCT") {
            self.max_daily_loss_pct = v;
        }
        if let Some(v) = parse_env_f64("FEEDER_TTL") {
            self.freshness.feeder_ttl = v;
        }
        if let Some(v) = parse_env_f64("TRADER_TTL") {
            self.freshness.trader_ttl = v;
        }
        if let Some(v) = parse_env_f64("ARES_TTL") {
            self.freshness.ares_ttl = v;
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.dry_run);
        assert!(!cfg.simulation_mode);
        assert_eq!(cfg.risk_limits.max_position_usdt, 1000.0);
        assert_eq!(cfg.freshness.feeder_ttl, 30.0);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.max_daily_loss_pct, 3.0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.dry_run = true;
        cfg.risk_limits.max_position_usdt = 2500.0;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!(loaded.dry_run);
        assert_eq!(loaded.risk_limits.max_position_usdt, 2500.0);
    }

    #[test]
    fn load_tolerates_partial_older_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        std::fs::write(&path, r#"{"dry_run": true}"#).unwrap();

        let cfg = RuntimeConfig::load(&path).unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.risk_limits.max_position_usdt, 1000.0);
    }

    #[test]
    fn simulation_guard_active_honors_either_flag() {
        let mut cfg = RuntimeConfig::default();
        assert!(!cfg.simulation_guard_active());
        cfg.simulation_mode = true;
        assert!(cfg.simulation_guard_active());
    }

    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("MAX_POSITION_USDT", "777");
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.risk_limits.max_position_usdt, 777.0);
        std::env::remove_var("MAX_POSITION_USDT");
    }
}
