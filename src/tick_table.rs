// =============================================================================
// KRX tick-size table and tick-rounded limit pricing
// =============================================================================
//
// Ported from the original engine's `_get_tick_size`/`calc_limit_price`
// (tools/order_executor.py). Bands are ascending, each band's tick applies to
// prices strictly below the next band's threshold.
// =============================================================================

/// Minimum price increment for `price` on the Korean exchange.
pub fn tick_size(price: f64) -> f64 {
    if price < 1_000.0 {
        1.0
    } else if price < 5_000.0 {
        5.0
    } else if price < 10_000.0 {
        10.0
    } else if price < 50_000.0 {
        50.0
    } else if price < 100_000.0 {
        100.0
    } else if price < 500_000.0 {
        500.0
    } else {
        1_000.0
    }
}

/// Tick-rounded limit price: `ask1` pushed out by `n_ticks` ticks, then
/// floored back onto the tick grid of `ask1`'s own band.
///
/// `limit_price(ask1, n_ticks) = floor((ask1 + tick(ask1) * n_ticks) / tick(ask1)) * tick(ask1)`
pub fn limit_price(ask1: f64, n_ticks: u32) -> f64 {
    let tick = tick_size(ask1);
    let raw = ask1 + tick * n_ticks as f64;
    (raw / tick).floor() * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_size_bands() {
        assert_eq!(tick_size(500.0), 1.0);
        assert_eq!(tick_size(999.0), 1.0);
        assert_eq!(tick_size(1_000.0), 5.0);
        assert_eq!(tick_size(4_999.0), 5.0);
        assert_eq!(tick_size(5_000.0), 10.0);
        assert_eq!(tick_size(9_999.0), 10.0);
        assert_eq!(tick_size(10_000.0), 50.0);
        assert_eq!(tick_size(49_999.0), 50.0);
        assert_eq!(tick_size(50_000.0), 100.0);
        assert_eq!(tick_size(99_999.0), 100.0);
        assert_eq!(tick_size(100_000.0), 500.0);
        assert_eq!(tick_size(499_999.0), 500.0);
        assert_eq!(tick_size(500_000.0), 1_000.0);
        assert_eq!(tick_size(999_999.0), 1_000.0);
        assert_eq!(tick_size(1_000_000.0), 1_000.0);
    }

    #[test]
    fn limit_price_three_ticks() {
        // ask1 = 72,000 -> tick 100 (band [50,000, 100,000)) -> +3 ticks = 72,300
        assert_eq!(limit_price(72_000.0, 3), 72_300.0);
    }

    #[test]
    fn limit_price_five_ticks_lower_band() {
        // ask1 = 8,000 -> tick 10 -> +5 ticks = 8,050
        assert_eq!(limit_price(8_000.0, 5), 8_050.0);
    }

    #[test]
    fn limit_price_floors_fractional_remainder() {
        // A non-tick-aligned ask1 still floors onto the grid after the push.
        let p = limit_price(10_003.0, 3); // tick(10_003) = 50
        assert_eq!(p, ((10_003.0 + 150.0) / 50.0).floor() * 50.0);
    }
}
