// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable risk/strategy parameter lives here so the engine can be
// reconfigured without a restart. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::AccountMode;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    Vec::new()
}

fn default_max_concurrent_positions() -> u32 {
    5
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_initial_stop_atr_mult() -> f64 {
    2.0
}

fn default_trailing_stop_pct() -> f64 {
    0.02
}

fn default_take_profit_pct() -> f64 {
    0.07
}

fn default_time_stop_days() -> i64 {
    3
}

fn default_pyramid_atr_trigger_mult() -> f64 {
    1.5
}

fn default_pyramid_add_ratio() -> f64 {
    0.30
}

fn default_pyramid_stop_pct() -> f64 {
    0.03
}

fn default_pyramid_max_count() -> u32 {
    2
}

fn default_base_position_pct() -> f64 {
    0.20
}

fn default_track2_min_pnl_pct() -> f64 {
    0.03
}

fn default_track2_max_population() -> u32 {
    2
}

fn default_track2_gap_down_pct() -> f64 {
    -0.01
}

fn default_track2_trail_pct() -> f64 {
    0.05
}

fn default_track2_deadline_hhmm() -> String {
    "14:00".to_string()
}

fn default_overnight_threshold_pnl_pct() -> f64 {
    0.05
}

fn default_overnight_min_eval_score() -> i64 {
    70
}

fn default_macro_boost_cap() -> u32 {
    6
}

fn default_no_pyramid_after_hhmm() -> String {
    "15:00".to_string()
}

fn default_rate_limit_capacity() -> f64 {
    18.0
}

fn default_rate_limit_refill_per_sec() -> f64 {
    18.0
}

fn default_rate_limit_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_http_max_retries() -> u32 {
    3
}

fn default_http_backoff_factor() -> f64 {
    0.4
}

fn default_twap_volume_threshold() -> f64 {
    0.005
}

fn default_twap_max_splits() -> u32 {
    4
}

fn default_twap_interval_secs() -> u64 {
    45
}

fn default_twap_tick_speed_min() -> f64 {
    5.0
}

fn default_stage1_settle_ms() -> u64 {
    150
}

fn default_stage2_presleep_ms() -> u64 {
    200
}

fn default_stage3_presleep_ms() -> u64 {
    50
}

fn default_vix_surge_threshold() -> f64 {
    0.20
}

fn default_kospi_drop_threshold() -> f64 {
    -0.02
}

fn default_fx_change_threshold() -> f64 {
    15.0
}

fn default_market_drop_count() -> u32 {
    7
}

fn default_risk_off_trigger_min() -> u32 {
    2
}

fn default_risk_off_confirm_wait_secs() -> u64 {
    60
}

fn default_watcher_check_interval_secs() -> u64 {
    60
}

fn default_recovery_min_wait_secs() -> u64 {
    1800
}

fn default_recovery_max_reentry() -> u32 {
    3
}

fn default_recovery_position_ratio() -> f64 {
    0.6
}

// =============================================================================
// WatcherParams
// =============================================================================

/// Thresholds for the market watcher's quantitative Risk-Off triggers and
/// the Recovery-watch state machine (spec §4.7.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherParams {
    /// Day-over-day VIX change that counts as a surge trigger.
    #[serde(default = "default_vix_surge_threshold")]
    pub vix_surge_threshold: f64,
    /// Day-over-day KOSPI change (negative) that counts as a drop trigger.
    #[serde(default = "default_kospi_drop_threshold")]
    pub kospi_drop_threshold: f64,
    /// Absolute day-over-day USD/KRW move in won that counts as a surge trigger.
    #[serde(default = "default_fx_change_threshold")]
    pub fx_change_threshold: f64,
    /// Estimated number of top-cap decliners that counts as a market-drop trigger.
    #[serde(default = "default_market_drop_count")]
    pub market_drop_count: u32,
    /// Minimum number of simultaneously-tripped triggers before Risk-Off is considered.
    #[serde(default = "default_risk_off_trigger_min")]
    pub risk_off_trigger_min: u32,
    /// Grace period before re-checking triggers that just tripped (noise filter).
    #[serde(default = "default_risk_off_confirm_wait_secs")]
    pub risk_off_confirm_wait_secs: u64,
    /// Polling period for the watcher loop.
    #[serde(default = "default_watcher_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Minimum time after a Risk-Off declaration before Recovery-watch begins.
    #[serde(default = "default_recovery_min_wait_secs")]
    pub recovery_min_wait_secs: u64,
    /// Maximum number of automatic re-entries after a Risk-Off episode.
    #[serde(default = "default_recovery_max_reentry")]
    pub recovery_max_reentry: u32,
    /// Conservative position-size ratio applied immediately after recovery.
    #[serde(default = "default_recovery_position_ratio")]
    pub recovery_position_ratio: f64,
}

impl Default for WatcherParams {
    fn default() -> Self {
        Self {
            vix_surge_threshold: default_vix_surge_threshold(),
            kospi_drop_threshold: default_kospi_drop_threshold(),
            fx_change_threshold: default_fx_change_threshold(),
            market_drop_count: default_market_drop_count(),
            risk_off_trigger_min: default_risk_off_trigger_min(),
            risk_off_confirm_wait_secs: default_risk_off_confirm_wait_secs(),
            check_interval_secs: default_watcher_check_interval_secs(),
            recovery_min_wait_secs: default_recovery_min_wait_secs(),
            recovery_max_reentry: default_recovery_max_reentry(),
            recovery_position_ratio: default_recovery_position_ratio(),
        }
    }
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Tunable parameters for the entry/exit pipeline (spec §4.5/§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// ATR multiplier for initial stop-loss distance (default 2.0).
    #[serde(default = "default_initial_stop_atr_mult")]
    pub initial_stop_atr_mult: f64,

    /// Trailing-stop distance from peak price (default 0.02 = 2%).
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,

    /// Take-profit distance from average cost (default 0.07 = 7%).
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Business days held before the time-stop fires (default 3).
    #[serde(default = "default_time_stop_days")]
    pub time_stop_days: i64,

    /// ATR multiple above entry price that triggers a pyramid add (default 1.5).
    #[serde(default = "default_pyramid_atr_trigger_mult")]
    pub pyramid_atr_trigger_mult: f64,

    /// Fraction of current position size added on a pyramid trigger (default 0.30).
    #[serde(default = "default_pyramid_add_ratio")]
    pub pyramid_add_ratio: f64,

    /// Stop distance below avg_cost set immediately after a pyramid add (default 0.03 = 3%).
    #[serde(default = "default_pyramid_stop_pct")]
    pub pyramid_stop_pct: f64,

    /// Maximum number of pyramid adds per position (default 2).
    #[serde(default = "default_pyramid_max_count")]
    pub pyramid_max_count: u32,

    /// Base position size as a fraction of total equity (default 0.20).
    #[serde(default = "default_base_position_pct")]
    pub base_position_pct: f64,

    /// Minimum unrealized P/L required for a Track-2 transition (default 0.03 = 3%).
    #[serde(default = "default_track2_min_pnl_pct")]
    pub track2_min_pnl_pct: f64,

    /// Maximum concurrent Track-2 positions (default 2).
    #[serde(default = "default_track2_max_population")]
    pub track2_max_population: u32,

    /// Next-day gap threshold below which a Track-2 position exits at market (default -0.01 = -1%).
    #[serde(default = "default_track2_gap_down_pct")]
    pub track2_gap_down_pct: f64,

    /// Next-day Track-2 trailing-stop distance (default 0.05 = 5%).
    #[serde(default = "default_track2_trail_pct")]
    pub track2_trail_pct: f64,

    /// Next-day Track-2 forced-close deadline, "HH:MM" KST (default "14:00").
    #[serde(default = "default_track2_deadline_hhmm")]
    pub track2_deadline_hhmm: String,

    /// Unrealized P/L that alone qualifies a Track-2 candidate as having a catalyst (default 0.05).
    #[serde(default = "default_overnight_threshold_pnl_pct")]
    pub overnight_threshold_pnl_pct: f64,

    /// Eval score that alone qualifies a Track-2 candidate as having a catalyst (default 70).
    #[serde(default = "default_overnight_min_eval_score")]
    pub overnight_min_eval_score: i64,

    /// Concurrent-position cap when the macro-boost window is active (default 6).
    #[serde(default = "default_macro_boost_cap")]
    pub macro_boost_cap: u32,

    /// Wall-clock cutoff, "HH:MM" KST, after which pyramiding is disabled for the day (default "15:00").
    #[serde(default = "default_no_pyramid_after_hhmm")]
    pub no_pyramid_after_hhmm: String,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            initial_stop_atr_mult: default_initial_stop_atr_mult(),
            trailing_stop_pct: default_trailing_stop_pct(),
            take_profit_pct: default_take_profit_pct(),
            time_stop_days: default_time_stop_days(),
            pyramid_atr_trigger_mult: default_pyramid_atr_trigger_mult(),
            pyramid_add_ratio: default_pyramid_add_ratio(),
            pyramid_stop_pct: default_pyramid_stop_pct(),
            pyramid_max_count: default_pyramid_max_count(),
            base_position_pct: default_base_position_pct(),
            track2_min_pnl_pct: default_track2_min_pnl_pct(),
            track2_max_population: default_track2_max_population(),
            track2_gap_down_pct: default_track2_gap_down_pct(),
            track2_trail_pct: default_track2_trail_pct(),
            track2_deadline_hhmm: default_track2_deadline_hhmm(),
            overnight_threshold_pnl_pct: default_overnight_threshold_pnl_pct(),
            overnight_min_eval_score: default_overnight_min_eval_score(),
            macro_boost_cap: default_macro_boost_cap(),
            no_pyramid_after_hhmm: default_no_pyramid_after_hhmm(),
        }
    }
}

// =============================================================================
// Risk parameters (mirrors the shape in §4.2's `update_risk_params`)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Normal,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_true")]
    pub pyramiding_allowed: bool,
    #[serde(default)]
    pub emergency_liquidate: bool,
    #[serde(default)]
    pub position_pct_override: Option<f64>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            risk_level: RiskLevel::Normal,
            pyramiding_allowed: true,
            emergency_liquidate: false,
            position_pct_override: None,
        }
    }
}

// =============================================================================
// Broker transport tuning
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerParams {
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: f64,
    #[serde(default = "default_rate_limit_refill_per_sec")]
    pub rate_limit_refill_per_sec: f64,
    #[serde(default = "default_rate_limit_acquire_timeout_ms")]
    pub rate_limit_acquire_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_http_max_retries")]
    pub http_max_retries: u32,
    #[serde(default = "default_http_backoff_factor")]
    pub http_backoff_factor: f64,
    #[serde(default = "default_stage1_settle_ms")]
    pub stage1_settle_ms: u64,
    #[serde(default = "default_stage2_presleep_ms")]
    pub stage2_presleep_ms: u64,
    #[serde(default = "default_stage3_presleep_ms")]
    pub stage3_presleep_ms: u64,
    #[serde(default = "default_twap_volume_threshold")]
    pub twap_volume_threshold: f64,
    #[serde(default = "default_twap_max_splits")]
    pub twap_max_splits: u32,
    #[serde(default = "default_twap_interval_secs")]
    pub twap_interval_secs: u64,
    #[serde(default = "default_twap_tick_speed_min")]
    pub twap_tick_speed_min: f64,
    /// Suppresses real broker writes: every order placement reports success
    /// with the full requested fill instead of calling the broker (spec
    /// §4.4.2/§6's CLI `--dry-run` flag). Not persisted across restarts by
    /// design — set from the CLI at startup, not the config file.
    #[serde(default, skip_serializing)]
    pub dry_run: bool,
}

impl Default for BrokerParams {
    fn default() -> Self {
        Self {
            rate_limit_capacity: default_rate_limit_capacity(),
            rate_limit_refill_per_sec: default_rate_limit_refill_per_sec(),
            rate_limit_acquire_timeout_ms: default_rate_limit_acquire_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            http_max_retries: default_http_max_retries(),
            http_backoff_factor: default_http_backoff_factor(),
            stage1_settle_ms: default_stage1_settle_ms(),
            stage2_presleep_ms: default_stage2_presleep_ms(),
            stage3_presleep_ms: default_stage3_presleep_ms(),
            twap_volume_threshold: default_twap_volume_threshold(),
            twap_max_splits: default_twap_max_splits(),
            twap_interval_secs: default_twap_interval_secs(),
            twap_tick_speed_min: default_twap_tick_speed_min(),
            dry_run: false,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Watched/tradeable symbols; normally overwritten each morning by the
    /// (external) scanner's watchlist, seeded here only for a cold start.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default)]
    pub strategy_params: StrategyParams,

    #[serde(default)]
    pub risk_params: RiskParams,

    #[serde(default)]
    pub broker_params: BrokerParams,

    #[serde(default)]
    pub watcher_params: WatcherParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            strategy_params: StrategyParams::default(),
            risk_params: RiskParams::default(),
            broker_params: BrokerParams::default(),
            watcher_params: WatcherParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) to avoid corruption on crash.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Environment-driven paper/live dual mode (spec §6)
// =============================================================================

/// Broker credentials and endpoint set resolved from `USE_PAPER` at startup.
/// All TR identifiers switch together; see spec §6.
#[derive(Debug, Clone)]
pub struct BrokerEnv {
    pub mode: AccountMode,
    pub base_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub product_code: String,
}

impl BrokerEnv {
    /// Read and validate broker credentials from the environment. Category-1
    /// (configuration) errors: missing/invalid env vars abort the process
    /// before anything else runs.
    pub fn from_env() -> Result<Self> {
        let use_paper = std::env::var("USE_PAPER")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .context("USE_PAPER must be 'true' or 'false'")?;

        let mode = if use_paper { AccountMode::Paper } else { AccountMode::Live };
        let prefix = if use_paper { "PAPER" } else { "LIVE" };

        let var = |name: &str| -> Result<String> {
            let key = format!("{prefix}_{name}");
            std::env::var(&key).with_context(|| format!("missing required env var {key}"))
        };

        let base_url = var("BASE_URL")?;
        let app_key = var("APP_KEY")?;
        let app_secret = var("APP_SECRET")?;
        let account_no = var("ACCOUNT_NO")?;
        let product_code = var("PRODUCT_CODE")?;

        if app_key.is_empty() || app_secret.is_empty() {
            bail!("APP_KEY/APP_SECRET must not be empty for mode {mode}");
        }

        Ok(Self { mode, base_url, app_key, app_secret, account_no, product_code })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_concurrent_positions, 5);
        assert!((cfg.max_daily_loss_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.initial_stop_atr_mult - 2.0).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.trailing_stop_pct - 0.02).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.take_profit_pct - 0.07).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_params.time_stop_days, 3);
        assert_eq!(cfg.strategy_params.pyramid_max_count, 2);
        assert_eq!(cfg.strategy_params.macro_boost_cap, 6);
        assert!(cfg.risk_params.pyramiding_allowed);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_concurrent_positions, 5);
        assert_eq!(cfg.risk_params.risk_level, RiskLevel::Normal);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "max_concurrent_positions": 2, "symbols": ["005930"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_concurrent_positions, 2);
        assert_eq!(cfg.symbols, vec!["005930"]);
        assert!((cfg.strategy_params.take_profit_pct - 0.07).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.strategy_params.time_stop_days, cfg2.strategy_params.time_stop_days);
    }

    #[test]
    fn risk_level_roundtrips() {
        let mut cfg = RuntimeConfig::default();
        cfg.risk_params.risk_level = RiskLevel::Critical;
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg2.risk_params.risk_level, RiskLevel::Critical);
    }
}
