// =============================================================================
// Signals Module
// =============================================================================
//
// Multi-timeframe alignment (§4.7.1) and trade-intensity read-through
// (§4.7.2) used to gate entries and to qualify Track-2 transitions.

pub mod alignment;
pub mod intensity;

pub use alignment::{alignment_from_closes, Alignment};
pub use intensity::intensity_allows_entry;
