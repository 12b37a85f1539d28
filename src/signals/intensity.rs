// =============================================================================
// Trade intensity read-through (spec §4.7.2)
// =============================================================================
//
// The score itself is computed externally (buy-side vs sell-side aggregated
// volume in a rolling window) and written into `SharedState` by the
// websocket-facing ingestion path; this module only applies the gating rule.
// A missing or zero reading disables the filter for that candidate: it
// cannot block an entry, but it also cannot satisfy a Track-2 qualification.

/// Whether a trade-intensity reading clears `threshold` for entry purposes.
/// `None` (missing) and `0.0` both mean "disabled" — returns `true` so the
/// filter never blocks when there's no reading.
pub fn intensity_allows_entry(score: Option<f64>, threshold: f64) -> bool {
    match score {
        None => true,
        Some(s) if s == 0.0 => true,
        Some(s) => s >= threshold,
    }
}

/// Whether a trade-intensity reading satisfies the stricter Track-2
/// qualification bar. Missing/zero readings can never satisfy Track-2.
pub fn intensity_qualifies_track2(score: Option<f64>, threshold: f64) -> bool {
    match score {
        None => false,
        Some(s) if s == 0.0 => false,
        Some(s) => s >= threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_reading_does_not_block_entry() {
        assert!(intensity_allows_entry(None, 0.70));
    }

    #[test]
    fn zero_reading_does_not_block_entry() {
        assert!(intensity_allows_entry(Some(0.0), 0.70));
    }

    #[test]
    fn below_threshold_blocks_entry() {
        assert!(!intensity_allows_entry(Some(0.5), 0.70));
    }

    #[test]
    fn at_threshold_allows_entry() {
        assert!(intensity_allows_entry(Some(0.70), 0.70));
    }

    #[test]
    fn missing_reading_cannot_qualify_track2() {
        assert!(!intensity_qualifies_track2(None, 0.60));
        assert!(!intensity_qualifies_track2(Some(0.0), 0.60));
    }

    #[test]
    fn sufficient_reading_qualifies_track2() {
        assert!(intensity_qualifies_track2(Some(0.65), 0.60));
    }
}
