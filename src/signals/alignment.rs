// =============================================================================
// Multi-timeframe alignment (spec §4.7.1)
// =============================================================================
//
// A code is 15m-aligned when MA(3) > MA(8) > MA(20) of closes on the
// 15-minute series (all three well-defined). The realtime source is a
// resampled 1-minute buffer; when that buffer is too short, callers fall
// back to the broker's `inquire_minute_bars` REST endpoint for the last 20
// 15-minute bars, then run the same calculation. If neither source yields
// >= 3 bars, alignment is `Neutral` and entry is declined.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Up,
    Down,
    Neutral,
}

/// Simple moving average of the last `period` values in `closes` (closes
/// ordered oldest-first). `None` if there aren't enough values.
fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    let avg = sum / period as f64;
    if avg.is_finite() {
        Some(avg)
    } else {
        None
    }
}

/// Compute alignment from a slice of 15-minute closes (oldest first).
///
/// Returns `Neutral` when fewer than 3 bars are available, matching spec's
/// "if neither source yields >= 3 bars, alignment returns NEUTRAL".
pub fn alignment_from_closes(closes_15m: &[f64]) -> Alignment {
    if closes_15m.len() < 3 {
        return Alignment::Neutral;
    }

    let ma3 = sma(closes_15m, 3);
    let ma8 = sma(closes_15m, 8);
    let ma20 = sma(closes_15m, 20);

    match (ma3, ma8, ma20) {
        (Some(a), Some(b), Some(c)) if a > b && b > c => Alignment::Up,
        (Some(a), Some(b), Some(c)) if a < b && b < c => Alignment::Down,
        _ => Alignment::Neutral,
    }
}

/// Resample a 1-minute close series to 15-minute bars by taking the close at
/// every 15th slot boundary, then run the same alignment check.
///
/// `minute_closes` must be ordered oldest-first and aligned to whole-minute
/// slots starting at the KST session open (09:00).
pub fn alignment_from_1m_buffer(minute_closes: &[f64]) -> Alignment {
    let resampled: Vec<f64> = minute_closes
        .iter()
        .copied()
        .step_by(15)
        .collect();
    alignment_from_closes(&resampled)
}
