// =============================================================================
// Position Lifecycle Manager (C5)
// =============================================================================
//
// Pure per-tick exit evaluation plus the state transitions spec §4.5
// describes: entry construction, stop/TP/time-stop precedence (stops only
// tighten), pyramiding, the 14:30 Track-2 transition, 15:10 force close, the
// next-day Track-2 handling, and emergency liquidation.
// =============================================================================

use chrono::{NaiveDate, NaiveTime};

use crate::config::StrategyParams;
use crate::state::{Position, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stop,
    TakeProfit,
    TimeStop,
    GapDown,
    Track2Deadline,
    Emergency,
    ForceClose,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub price: f64,
}

/// Build a freshly-filled position (spec §4.5 "Entry").
pub fn open_position(
    code: impl Into<String>,
    entry_price: f64,
    quantity: f64,
    quantity_fraction: f64,
    entry_atr: f64,
    params: &StrategyParams,
    entry_timestamp: chrono::DateTime<chrono::Utc>,
    entry_date: NaiveDate,
) -> Position {
    Position {
        code: code.into(),
        entry_price,
        avg_cost: entry_price,
        quantity_fraction,
        quantity,
        entry_atr,
        stop_price: entry_price - entry_atr * params.initial_stop_atr_mult,
        peak_price: entry_price,
        hold_days: 0,
        pyramid_count: 0,
        track: Track::One,
        entry_timestamp,
        entry_date,
    }
}

/// Per-tick exit evaluation (spec §4.5 steps 1-4). Mutates `peak_price` and
/// `stop_price` in place (stops only tighten) and returns an exit signal if
/// one of the three ordered conditions fires.
pub fn evaluate_exit(position: &mut Position, last_price: f64, params: &StrategyParams) -> Option<ExitSignal> {
    position.peak_price = position.peak_price.max(last_price);
    let trail_stop = position.peak_price * (1.0 - params.trailing_stop_pct);
    let effective_stop = position.stop_price.max(trail_stop);
    position.stop_price = effective_stop;

    if last_price <= effective_stop {
        return Some(ExitSignal { reason: ExitReason::Stop, price: effective_stop });
    }

    let pnl_pct = (last_price - position.avg_cost) / position.avg_cost;
    if pnl_pct >= params.take_profit_pct {
        return Some(ExitSignal {
            reason: ExitReason::TakeProfit,
            price: position.avg_cost * (1.0 + params.take_profit_pct),
        });
    }

    if position.hold_days >= params.time_stop_days {
        return Some(ExitSignal { reason: ExitReason::TimeStop, price: last_price });
    }

    None
}

/// Whether a pyramid add should fire for this position right now (spec §4.5
/// "Pyramiding"): count cap, time cutoff, risk-params gate, and the
/// ATR-multiple trigger.
pub fn should_pyramid(
    position: &Position,
    last_price: f64,
    params: &StrategyParams,
    pyramiding_allowed: bool,
    now: NaiveTime,
    no_pyramid_after: NaiveTime,
) -> bool {
    if !pyramiding_allowed {
        return false;
    }
    if position.pyramid_count >= params.pyramid_max_count {
        return false;
    }
    if now >= no_pyramid_after {
        return false;
    }
    last_price >= position.entry_price + position.entry_atr * params.pyramid_atr_trigger_mult
}

/// Apply a pyramid add: weighted-average the cost basis, tighten the stop,
/// bump the count. `add_qty`/`add_price` describe the fill just executed.
pub fn apply_pyramid_add(position: &mut Position, add_qty: f64, add_price: f64, params: &StrategyParams) {
    let total_qty = position.quantity + add_qty;
    if total_qty > 0.0 {
        position.avg_cost = (position.avg_cost * position.quantity + add_price * add_qty) / total_qty;
    }
    position.quantity = total_qty;
    position.quantity_fraction += params.pyramid_add_ratio * position.quantity_fraction;
    position.stop_price = position.avg_cost * (1.0 - params.pyramid_stop_pct);
    position.pyramid_count += 1;
}

pub struct Track2Qualification {
    pub pnl_pct_ok: bool,
    pub aligned: bool,
    pub intensity_ok: bool,
    pub has_catalyst: bool,
    pub population_ok: bool,
}

impl Track2Qualification {
    pub fn qualifies(&self) -> bool {
        self.pnl_pct_ok && self.aligned && self.intensity_ok && self.has_catalyst && self.population_ok
    }
}

/// Track-2 transition check (spec §4.5 "Track-2 transition (14:30 only)"):
/// all five conditions must hold. On success the caller resets `peak_price`
/// to the current price so trailing restarts from the transition point.
pub fn evaluate_track2_transition(
    position: &Position,
    last_price: f64,
    aligned: bool,
    intensity_score: Option<f64>,
    has_catalyst: bool,
    eval_score: Option<i64>,
    current_track2_population: u32,
    params: &StrategyParams,
) -> Track2Qualification {
    let pnl_pct = (last_price - position.avg_cost) / position.avg_cost;
    let pnl_pct_ok = pnl_pct >= params.track2_min_pnl_pct;
    let intensity_ok = crate::signals::intensity::intensity_qualifies_track2(intensity_score, 0.60);
    let catalyst = has_catalyst
        || eval_score.map(|s| s >= params.overnight_min_eval_score).unwrap_or(false)
        || pnl_pct >= params.overnight_threshold_pnl_pct;
    let population_ok = current_track2_population < params.track2_max_population;

    Track2Qualification {
        pnl_pct_ok,
        aligned,
        intensity_ok,
        has_catalyst: catalyst,
        population_ok,
    }
}

/// Next-day Track-2 open-gap check (spec §4.5 "Next-day Track-2 handling").
pub fn track2_gap_down_exit(prior_close: f64, open_price: f64, params: &StrategyParams) -> Option<ExitSignal> {
    let gap = (open_price - prior_close) / prior_close;
    if gap <= params.track2_gap_down_pct {
        Some(ExitSignal { reason: ExitReason::GapDown, price: open_price })
    } else {
        None
    }
}

/// Next-day Track-2 trailing-stop check, active until the 14:00 deadline.
pub fn track2_trail_exit(position: &mut Position, last_price: f64, params: &StrategyParams) -> Option<ExitSignal> {
    position.peak_price = position.peak_price.max(last_price);
    let trail_stop = position.peak_price * (1.0 - params.track2_trail_pct);
    if last_price <= trail_stop {
        Some(ExitSignal { reason: ExitReason::Stop, price: trail_stop })
    } else {
        None
    }
}
