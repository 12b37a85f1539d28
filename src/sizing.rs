// =============================================================================
// Position sizing pipeline (spec §4.6.2) and regime-filter pipeline (§4.6.1 step 2)
// =============================================================================
//
// Ported from `head_strategist.py`'s final_pct computation:
//   final_pct = base_fraction * macro_position_multiplier * scanner_suggested_fraction
//               * time_of_day_weight * event_multiplier
//               * strategy_label_multiplier * recovery_multiplier
// then clamped to the macro-boost-aware cap and zeroed below a minimum
// tradeable fraction. The regime-filter pipeline that derives
// `macro_position_multiplier` from the macro-supplied suggestion lives here
// too since it feeds directly into the same computation.
// =============================================================================

use chrono::NaiveTime;

use crate::config::StrategyParams;
use crate::state::{RegimeLabel, RegimeSnapshot};

/// Time-of-day weight table (KST), latest matching entry wins. Before the
/// first key the weight is 0.0 — entries are skipped before `OpeningRushEnd`
/// (09:20) by the tick cycle anyway, so this only matters for direct callers.
const TIME_OF_DAY_WEIGHTS: &[(&str, f64)] = &[
    ("09:20", 0.5),
    ("09:30", 0.8),
    ("10:00", 1.0),
    ("10:30", 0.9),
    ("11:00", 0.7),
    ("11:30", 0.6),
    ("13:00", 0.7),
];

const MIN_TRADEABLE_FRACTION: f64 = 0.02;

/// Fixed cap multiplier applied when the macro-boost window is active (spec
/// §4.6.2: "Cap <= base_fraction * (macro_boost_mult if boost active else
/// 1.0)"). This is a constant ceiling, not the accumulated
/// `macro_position_multiplier`, which can itself exceed 1.20 once the
/// USD/KOSPI sub-multipliers stack on top of the boost.
const MACRO_BOOST_POSITION_MULT: f64 = 1.20;

fn parse_hhmm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap_or(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

/// Time-of-day weight for `now` (KST wall-clock time), per the table above.
pub fn time_of_day_weight(now: NaiveTime) -> f64 {
    let mut weight = 0.0;
    for (hhmm, w) in TIME_OF_DAY_WEIGHTS {
        if now >= parse_hhmm(hhmm) {
            weight = *w;
        }
    }
    weight
}

/// Event multiplier: a breakout without a same-day catalyst (negative day
/// return and unremarkable volume) gets its size cut, not blocked.
pub fn event_multiplier(day_return_pct: Option<f64>, vol_ratio: f64) -> f64 {
    match day_return_pct {
        Some(ret) if ret < 0.0 && vol_ratio < 3.0 => 0.60,
        _ => 1.0,
    }
}

/// Multiplier derived from the regime's optional strategy label, in the
/// original's vocabulary ("방어적" defensive / "공격적" aggressive).
pub fn strategy_label_multiplier(strategy_label: Option<&str>) -> f64 {
    match strategy_label {
        Some("방어적") => 0.5,
        Some("공격적") => 1.2,
        _ => 1.0,
    }
}

/// Result of applying the tick cycle's regime-filter pipeline (spec §4.6.1
/// step 2) to the working macro position multiplier.
pub struct RegimeFilterResult {
    pub multiplier: f64,
    pub macro_boost_active: bool,
}

/// Apply the regime filters to the macro-supplied suggestion, starting at
/// the default 0.5 when unset. Returns `None` when entries are fully blocked
/// this cycle (Neutral regime).
pub fn apply_regime_filters(regime: &RegimeSnapshot) -> Option<RegimeFilterResult> {
    let neutral_block = regime.regime_label == RegimeLabel::Neutral
        || regime.strategy_label.as_deref() == Some("중립");
    if neutral_block {
        return None;
    }

    let mut multiplier = regime.suggested_position_multiplier.unwrap_or(0.5);

    if regime.usd_krw_change_pct > 0.5 {
        multiplier *= 0.7;
    }
    if regime.kospi_5d_change_pct >= 2.0 {
        multiplier *= 1.1;
    }
    let boost = macro_boost_active(regime, 3.0);
    if boost {
        multiplier *= 1.20;
    }

    Some(RegimeFilterResult { multiplier, macro_boost_active: boost })
}

/// Compute the final position fraction for a candidate entry (spec §4.6.2).
/// `macro_position_multiplier` is the output of `apply_regime_filters`;
/// `recovery_active` reflects the market watcher's RECOVERED substate.
#[allow(clippy::too_many_arguments)]
pub fn final_position_fraction(
    params: &StrategyParams,
    macro_position_multiplier: f64,
    scanner_suggested_fraction: f64,
    time_weight: f64,
    event_mult: f64,
    strategy_label: Option<&str>,
    recovery_active: bool,
    macro_boost_active: bool,
) -> f64 {
    let mut fraction = params.base_position_pct
        * macro_position_multiplier
        * scanner_suggested_fraction
        * time_weight
        * event_mult
        * strategy_label_multiplier(strategy_label);

    if recovery_active {
        fraction *= 0.6;
    }

    let cap = if macro_boost_active {
        params.base_position_pct * MACRO_BOOST_POSITION_MULT
    } else {
        params.base_position_pct
    };
    fraction = fraction.min(cap);

    if fraction < MIN_TRADEABLE_FRACTION {
        0.0
    } else {
        fraction
    }
}

/// Whether the macro-boost window (strong KOSPI momentum + USD above its
/// 20-day MA) is currently active, raising both the position multiplier and
/// the concurrent-position cap.
pub fn macro_boost_active(regime: &RegimeSnapshot, kospi_strong_momentum_pct: f64) -> bool {
    regime.kospi_5d_change_pct >= kospi_strong_momentum_pct && regime.usd_above_ma20
}

/// Effective concurrent-position cap for the current regime (5, expanded to
/// 6 when the macro-boost window is active).
pub fn effective_position_cap(base_cap: u32, macro_boost_cap: u32, boost_active: bool) -> u32 {
    if boost_active {
        macro_boost_cap
    } else {
        base_cap
    }
}

/// Derive tradeable share quantity from the final fraction and current
/// equity (spec §4.6.2: `floor(total_equity * final_fraction / ask1)`).
pub fn quantity_from_fraction(total_equity: f64, final_fraction: f64, ask1: f64) -> u64 {
    if ask1 <= 0.0 {
        return 0;
    }
    ((total_equity * final_fraction) / ask1).floor().max(0.0) as u64
}
