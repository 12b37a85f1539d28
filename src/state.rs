// =============================================================================
// Shared State Store (C2) — single source of truth for the engine
// =============================================================================
//
// One `parking_lot::RwLock` per entity family, mirroring the teacher's
// `app_state.rs` layout. Every accessor returns a deep copy or an immutable
// view; every mutator is a narrow, named method — callers never get a
// reference into internal storage (spec §3 "Ownership", §4.2 invariants).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::RiskParams;
use crate::types::{Code, EvalGrade, Track};

// =============================================================================
// Watchlist
// =============================================================================

/// Scanner-owned candidate entry. Read-only to the core (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub code: Code,
    pub eval_grade: EvalGrade,
    pub eval_score: i64,
    pub suggested_position_fraction: f64,
    pub sector: String,
    pub entry_atr: f64,
    pub day_return_pct: f64,
    pub vol_ratio: f64,
    pub catalyst: Option<String>,
}

// =============================================================================
// Regime snapshot
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroRisk {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrgentAction {
    None,
    Reduce,
    ExitAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeLabel {
    RiskOn,
    Neutral,
    RiskOff,
}

/// Macro-analyst-owned snapshot. Read-only to the core (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub risk: MacroRisk,
    pub urgent_action: UrgentAction,
    pub sectors_favored: Vec<String>,
    pub sectors_avoid: Vec<String>,
    /// Clamped to [0.5, 1.5] on ingestion; unknown keys default to 1.0.
    pub sector_multipliers: HashMap<String, f64>,
    pub regime_label: RegimeLabel,
    pub kospi_5d_change_pct: f64,
    pub usd_krw_change_pct: f64,
    pub usd_above_ma20: bool,
    /// Strategy label in the original's vocabulary ("방어적"/"공격적"), if any.
    pub strategy_label: Option<String>,
    /// Macro-suggested starting position multiplier; spec default 0.5 if unset.
    pub suggested_position_multiplier: Option<f64>,
}

impl Default for RegimeSnapshot {
    /// Absence is treated as `risk=ON, urgent_action=NONE, regime_label=neutral`
    /// per spec §3.
    fn default() -> Self {
        Self {
            risk: MacroRisk::On,
            urgent_action: UrgentAction::None,
            sectors_favored: Vec::new(),
            sectors_avoid: Vec::new(),
            sector_multipliers: HashMap::new(),
            regime_label: RegimeLabel::Neutral,
            kospi_5d_change_pct: 0.0,
            usd_krw_change_pct: 0.0,
            usd_above_ma20: false,
            strategy_label: None,
            suggested_position_multiplier: None,
        }
    }
}

impl RegimeSnapshot {
    /// Clamp all sector multipliers into [0.5, 1.5] on ingestion (spec §9).
    pub fn clamp_multipliers(&mut self) {
        for v in self.sector_multipliers.values_mut() {
            *v = v.clamp(0.5, 1.5);
        }
    }

    /// Multiplier for a given sector/code, defaulting to 1.0 for unknown keys.
    pub fn multiplier_for(&self, key: &str) -> f64 {
        self.sector_multipliers.get(key).copied().unwrap_or(1.0)
    }
}

// =============================================================================
// Position
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub code: Code,
    pub entry_price: f64,
    pub avg_cost: f64,
    /// Fraction of total equity this position represents.
    pub quantity_fraction: f64,
    pub quantity: f64,
    pub entry_atr: f64,
    pub stop_price: f64,
    pub peak_price: f64,
    pub hold_days: i64,
    pub pyramid_count: u32,
    pub track: Track,
    pub entry_timestamp: chrono::DateTime<Utc>,
    pub entry_date: NaiveDate,
}

// =============================================================================
// Track info (parallel to Position)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    pub code: Code,
    pub track: Track,
    pub entry_price: f64,
    pub entry_time_hhmmss: String,
    pub max_pnl_pct_seen: f64,
    /// Closing price captured at end-of-day, used by the next-day Track-2
    /// gap-down check (spec §4.5 "Next-day Track-2 handling").
    pub prior_close: Option<f64>,
}

// =============================================================================
// Shared State Store
// =============================================================================

pub struct SharedState {
    version: AtomicU64,

    risk_off: RwLock<bool>,
    positions: RwLock<HashMap<Code, Position>>,
    watchlist: RwLock<Vec<WatchlistEntry>>,
    regime: RwLock<RegimeSnapshot>,
    track_info: RwLock<HashMap<Code, TrackInfo>>,
    blacklist: RwLock<HashSet<Code>>,
    risk_params: RwLock<RiskParams>,
    daily_loss_pct: RwLock<f64>,
    /// 15-minute/5-minute alignment reads, written by the signal layer.
    tf15_trends: RwLock<HashMap<Code, crate::signals::alignment::Alignment>>,
    /// Externally-scored trade intensity, in [0, 2]; spec §4.7.2.
    trade_intensity: RwLock<HashMap<Code, f64>>,
    /// Realtime tick-strength reading per code (from the websocket feed).
    chg_strength: RwLock<HashMap<Code, f64>>,
    re_entry_count: RwLock<u32>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            risk_off: RwLock::new(false),
            positions: RwLock::new(HashMap::new()),
            watchlist: RwLock::new(Vec::new()),
            regime: RwLock::new(RegimeSnapshot::default()),
            track_info: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            risk_params: RwLock::new(RiskParams::default()),
            daily_loss_pct: RwLock::new(0.0),
            tf15_trends: RwLock::new(HashMap::new()),
            trade_intensity: RwLock::new(HashMap::new()),
            chg_strength: RwLock::new(HashMap::new()),
            re_entry_count: RwLock::new(0),
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    // --- Positions -----------------------------------------------------------

    pub fn get_positions(&self) -> HashMap<Code, Position> {
        self.positions.read().clone()
    }

    pub fn get_position(&self, code: &str) -> Option<Position> {
        self.positions.read().get(code).cloned()
    }

    pub fn add_position(&self, pos: Position) {
        self.positions.write().insert(pos.code.clone(), pos);
        self.bump_version();
    }

    /// Apply a patch function to a position in place, if present.
    pub fn update_position(&self, code: &str, patch: impl FnOnce(&mut Position)) {
        if let Some(pos) = self.positions.write().get_mut(code) {
            patch(pos);
            self.bump_version();
        }
    }

    pub fn remove_position(&self, code: &str) -> Option<Position> {
        let removed = self.positions.write().remove(code);
        if removed.is_some() {
            self.bump_version();
        }
        removed
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().len()
    }

    // --- Watchlist -------------------------------------------------------------

    pub fn get_watchlist(&self) -> Vec<WatchlistEntry> {
        self.watchlist.read().clone()
    }

    pub fn set_watchlist(&self, list: Vec<WatchlistEntry>) {
        *self.watchlist.write() = list;
        self.bump_version();
    }

    // --- Regime ----------------------------------------------------------------

    pub fn get_regime(&self) -> RegimeSnapshot {
        self.regime.read().clone()
    }

    pub fn set_regime(&self, mut snapshot: RegimeSnapshot) {
        snapshot.clamp_multipliers();
        *self.regime.write() = snapshot;
        self.bump_version();
    }

    // --- Track info --------------------------------------------------------

    pub fn get_track(&self, code: &str) -> Option<TrackInfo> {
        self.track_info.read().get(code).cloned()
    }

    pub fn set_track(&self, code: &str, info: TrackInfo) {
        self.track_info.write().insert(code.to_string(), info);
        self.bump_version();
    }

    pub fn update_track_pnl(&self, code: &str, current_pnl_pct: f64) {
        if let Some(info) = self.track_info.write().get_mut(code) {
            if current_pnl_pct > info.max_pnl_pct_seen {
                info.max_pnl_pct_seen = current_pnl_pct;
            }
        }
    }

    // --- Blacklist ---------------------------------------------------------

    pub fn add_to_blacklist(&self, code: &str) {
        self.blacklist.write().insert(code.to_string());
        self.bump_version();
    }

    pub fn is_blacklisted(&self, code: &str) -> bool {
        self.blacklist.read().contains(code)
    }

    /// Cleared by the pre-open event; blacklist is session-scoped (spec §4.2).
    pub fn clear_blacklist(&self) {
        self.blacklist.write().clear();
        self.bump_version();
    }

    // --- Risk params ---------------------------------------------------------

    pub fn get_risk_params(&self) -> RiskParams {
        self.risk_params.read().clone()
    }

    pub fn update_risk_params(&self, patch: impl FnOnce(&mut RiskParams)) {
        patch(&mut self.risk_params.write());
        self.bump_version();
    }

    // --- Risk-off flag -------------------------------------------------------

    pub fn is_risk_off(&self) -> bool {
        *self.risk_off.read()
    }

    pub fn set_risk_off(&self, value: bool) {
        *self.risk_off.write() = value;
        self.bump_version();
    }

    // --- Daily loss ------------------------------------------------------------

    pub fn daily_loss_pct(&self) -> f64 {
        *self.daily_loss_pct.read()
    }

    pub fn add_realized_pnl_pct(&self, pnl_pct: f64) {
        if pnl_pct < 0.0 {
            *self.daily_loss_pct.write() += pnl_pct.abs();
        }
    }

    /// Reset at each pre-open event (spec §3 "Daily loss counter resets").
    pub fn reset_daily(&self) {
        *self.daily_loss_pct.write() = 0.0;
        self.clear_blacklist();
        *self.re_entry_count.write() = 0;
        self.bump_version();
    }

    // --- Alignment / intensity / tick strength --------------------------------

    pub fn set_alignment(&self, code: &str, alignment: crate::signals::alignment::Alignment) {
        self.tf15_trends.write().insert(code.to_string(), alignment);
    }

    pub fn get_alignment(&self, code: &str) -> Option<crate::signals::alignment::Alignment> {
        self.tf15_trends.read().get(code).copied()
    }

    pub fn set_trade_intensity(&self, code: &str, score: f64) {
        self.trade_intensity.write().insert(code.to_string(), score);
    }

    pub fn get_trade_intensity(&self, code: &str) -> Option<f64> {
        self.trade_intensity.read().get(code).copied()
    }

    pub fn set_chg_strength(&self, code: &str, value: f64) {
        self.chg_strength.write().insert(code.to_string(), value);
    }

    pub fn get_chg_strength(&self, code: &str) -> f64 {
        self.chg_strength.read().get(code).copied().unwrap_or(0.0)
    }

    // --- Recovery re-entry counter -------------------------------------------

    pub fn re_entry_count(&self) -> u32 {
        *self.re_entry_count.read()
    }

    pub fn increment_re_entry_count(&self) -> u32 {
        let mut guard = self.re_entry_count.write();
        *guard += 1;
        *guard
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
