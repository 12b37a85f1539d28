// =============================================================================
// Market Watcher & Risk-Off declaration (§4.7.3)
// =============================================================================
//
// An independent long-lived loop samples four macro triggers, double-confirms
// a tripped state with a cooldown recheck plus an adjudication step, and
// drives a NONE -> WATCHING -> RECOVERED state machine once Risk-Off has been
// declared. Both the macro data feed and the adjudication step are pluggable
// traits: the concrete sources are an external concern (spec §9), so the
// engine ships a regime-snapshot-backed sampler and a quantitative-only
// adjudicator that trusts the trigger recheck when no external judge is wired
// in.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{RiskLevel, WatcherParams};
use crate::notifier::Notifier;
use crate::state::SharedState;

/// One sample of the four macro surrogates. Any field may be `None` when the
/// underlying source has no reading yet; a `None` trigger never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct MacroSample {
    pub vix_change_pct: Option<f64>,
    pub kospi_change_pct: Option<f64>,
    pub usd_krw_change_won: Option<f64>,
    pub top_cap_decline_estimate: Option<u32>,
}

/// Supplies the watcher with a fresh macro reading each cycle. The concrete
/// data pipeline (VIX/KOSPI/FX surrogates) is an external concern; this trait
/// is the seam implementers substitute their own feed through.
#[async_trait]
pub trait MacroTriggerSource: Send + Sync {
    async fn sample(&self) -> MacroSample;
}

/// Reads the macro fields the (external) macro analyst already wrote into
/// the shared regime snapshot. VIX and top-cap decline count have no
/// corresponding field in the regime snapshot today, so those two triggers
/// never fire under this source — a real deployment can swap in a dedicated
/// index-quote source without touching the watcher itself.
pub struct RegimeSnapshotSource {
    state: Arc<SharedState>,
}

impl RegimeSnapshotSource {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl MacroTriggerSource for RegimeSnapshotSource {
    async fn sample(&self) -> MacroSample {
        let regime = self.state.get_regime();
        MacroSample {
            vix_change_pct: None,
            kospi_change_pct: Some(regime.kospi_5d_change_pct / 100.0),
            usd_krw_change_won: Some(regime.usd_krw_change_pct),
            top_cap_decline_estimate: None,
        }
    }
}

/// Adjudicates a tripped/recovering trigger set. The production pipeline
/// calls out to an LLM (spec §4.7.3); this crate ships a trait seam plus a
/// quantitative-only fallback that always confirms, matching the original's
/// documented behavior when no external judge is configured.
#[async_trait]
pub trait RiskAdjudicator: Send + Sync {
    async fn confirm_risk_off(&self, details: &[String]) -> bool;
    async fn confirm_stabilized(&self) -> bool;
}

pub struct QuantitativeOnlyAdjudicator;

#[async_trait]
impl RiskAdjudicator for QuantitativeOnlyAdjudicator {
    async fn confirm_risk_off(&self, _details: &[String]) -> bool {
        true
    }

    async fn confirm_stabilized(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    None,
    Watching,
    Recovered,
}

struct Inner {
    recovery_state: RecoveryState,
    risk_off_since: Option<DateTime<Utc>>,
}

/// Long-lived watcher task. Holds no broker or execution authority of its
/// own — it only flips C2's `risk_off`/risk-params flags; the strategist
/// loop is responsible for reacting (blocking entries, liquidating).
pub struct MarketWatcher {
    state: Arc<SharedState>,
    notifier: Arc<Notifier>,
    source: Arc<dyn MacroTriggerSource>,
    adjudicator: Arc<dyn RiskAdjudicator>,
    params: WatcherParams,
    inner: RwLock<Inner>,
}

impl MarketWatcher {
    pub fn new(
        state: Arc<SharedState>,
        notifier: Arc<Notifier>,
        source: Arc<dyn MacroTriggerSource>,
        adjudicator: Arc<dyn RiskAdjudicator>,
        params: WatcherParams,
    ) -> Self {
        Self {
            state,
            notifier,
            source,
            adjudicator,
            params,
            inner: RwLock::new(Inner {
                recovery_state: RecoveryState::None,
                risk_off_since: None,
            }),
        }
    }

    /// Drive the watcher forever at `check_interval_secs`. Errors from a
    /// single cycle are logged and never stop the loop.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.params.check_interval_secs));
        loop {
            interval.tick().await;
            self.check_cycle().await;
        }
    }

    /// Whether the watcher is currently in the conservative RECOVERED
    /// substate (spec §4.6.2's `recovery_active` sizing input).
    pub fn is_recovered(&self) -> bool {
        self.inner.read().recovery_state == RecoveryState::Recovered
    }

    pub async fn check_cycle(&self) {
        if self.state.is_risk_off() {
            self.run_recovery_watch().await;
            return;
        }

        let (triggered, details) = self.check_quantitative_triggers().await;
        if triggered.len() as u32 >= self.params.risk_off_trigger_min {
            info!(count = triggered.len(), ?details, "risk-off trigger(s) tripped, entering confirm window");
            tokio::time::sleep(Duration::from_secs(self.params.risk_off_confirm_wait_secs)).await;

            let (triggered2, details2) = self.check_quantitative_triggers().await;
            if triggered2.len() as u32 >= self.params.risk_off_trigger_min {
                if self.adjudicator.confirm_risk_off(&details2).await {
                    self.declare_risk_off(&details2).await;
                } else {
                    self.adjust_params_only();
                }
            } else {
                info!("triggers resolved during confirm window, risk-off cancelled");
            }
        }
    }

    async fn check_quantitative_triggers(&self) -> (Vec<&'static str>, Vec<String>) {
        let sample = self.source.sample().await;
        let mut triggered = Vec::new();
        let mut details = Vec::new();

        if let Some(chg) = sample.vix_change_pct {
            if chg >= self.params.vix_surge_threshold {
                triggered.push("VIX_SURGE");
                details.push(format!(
                    "VIX {:+.1}% (threshold +{:.0}%)",
                    chg * 100.0,
                    self.params.vix_surge_threshold * 100.0
                ));
            }
        }
        if let Some(chg) = sample.kospi_change_pct {
            if chg <= self.params.kospi_drop_threshold {
                triggered.push("KOSPI_DROP");
                details.push(format!(
                    "KOSPI {:+.2}% (threshold {:.0}%)",
                    chg * 100.0,
                    self.params.kospi_drop_threshold * 100.0
                ));
            }
        }
        if let Some(chg) = sample.usd_krw_change_won {
            if chg.abs() >= self.params.fx_change_threshold {
                triggered.push("FX_SURGE");
                details.push(format!(
                    "USD/KRW {:+.0} won (threshold +/-{:.0})",
                    chg, self.params.fx_change_threshold
                ));
            }
        }
        if let Some(count) = sample.top_cap_decline_estimate {
            if count >= self.params.market_drop_count {
                triggered.push("MARKET_DROP");
                details.push(format!(
                    "~{count} top-cap names declining (threshold {})",
                    self.params.market_drop_count
                ));
            }
        }
        (triggered, details)
    }

    async fn declare_risk_off(&self, details: &[String]) {
        warn!(?details, "RISK-OFF declared");
        self.state.set_risk_off(true);
        {
            let mut inner = self.inner.write();
            inner.risk_off_since = Some(Utc::now());
            inner.recovery_state = RecoveryState::None;
        }
        self.state.update_risk_params(|p| {
            p.risk_level = RiskLevel::Critical;
            p.pyramiding_allowed = false;
            p.emergency_liquidate = true;
        });
        self.notifier
            .send(&format!(
                "RISK-OFF declared. Triggers: {}. New entries blocked, positions flagged for liquidation.",
                details.join("; ")
            ))
            .await;
    }

    /// LLM (or equivalent) declined to confirm Risk-Off: tighten parameters
    /// without halting trading entirely.
    fn adjust_params_only(&self) {
        info!("risk-off adjudication declined, tightening parameters only");
        self.state.update_risk_params(|p| {
            p.risk_level = RiskLevel::High;
            p.pyramiding_allowed = false;
        });
    }

    async fn run_recovery_watch(&self) {
        let (recovery_state, risk_off_since) = {
            let inner = self.inner.read();
            (inner.recovery_state, inner.risk_off_since)
        };

        // Reentry count lives on `SharedState` so it resets with the rest of
        // the day's bookkeeping at `reset_daily` (spec.md:272 — the cap is
        // per-day, not lifetime).
        if self.state.re_entry_count() >= self.params.recovery_max_reentry {
            return;
        }

        match recovery_state {
            RecoveryState::None => {
                if let Some(since) = risk_off_since {
                    let elapsed = (Utc::now() - since).num_seconds().max(0) as u64;
                    if elapsed >= self.params.recovery_min_wait_secs {
                        self.inner.write().recovery_state = RecoveryState::Watching;
                        info!(elapsed_secs = elapsed, "recovery watch started");
                    }
                }
            }
            RecoveryState::Watching => {
                let (triggered, _) = self.check_quantitative_triggers().await;
                if triggered.len() as u32 >= self.params.risk_off_trigger_min {
                    return;
                }
                if self.adjudicator.confirm_stabilized().await {
                    self.execute_recovery().await;
                }
            }
            RecoveryState::Recovered => {}
        }
    }

    async fn execute_recovery(&self) {
        self.inner.write().recovery_state = RecoveryState::Recovered;
        let reentry_count = self.state.increment_re_entry_count();
        self.state.set_risk_off(false);
        self.state.update_risk_params(|p| {
            p.risk_level = RiskLevel::High;
            p.pyramiding_allowed = false;
            p.emergency_liquidate = false;
            p.position_pct_override = Some(self.params.recovery_position_ratio);
        });
        info!(
            reentry_count,
            ratio = self.params.recovery_position_ratio,
            "recovery executed, trading resumed conservatively"
        );
        self.notifier
            .send(&format!(
                "Risk-Off lifted. Conservative re-entry #{reentry_count} at {:.0}% sizing.",
                self.params.recovery_position_ratio * 100.0
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;

    struct FixedSource(MacroSample);

    #[async_trait]
    impl MacroTriggerSource for FixedSource {
        async fn sample(&self) -> MacroSample {
            self.0
        }
    }

    fn watcher_with(sample: MacroSample, params: WatcherParams) -> Arc<MarketWatcher> {
        Arc::new(MarketWatcher::new(
            Arc::new(SharedState::new()),
            Arc::new(Notifier::from_env()),
            Arc::new(FixedSource(sample)),
            Arc::new(QuantitativeOnlyAdjudicator),
            params,
        ))
    }

    #[tokio::test]
    async fn below_threshold_triggers_do_not_declare_risk_off() {
        let sample = MacroSample { kospi_change_pct: Some(-0.005), ..Default::default() };
        let watcher = watcher_with(sample, WatcherParams { risk_off_confirm_wait_secs: 0, ..WatcherParams::default() });
        watcher.check_cycle().await;
        assert!(!watcher.state.is_risk_off());
    }

    #[tokio::test]
    async fn two_triggers_declare_risk_off_after_confirm() {
        let sample = MacroSample {
            kospi_change_pct: Some(-0.03),
            usd_krw_change_won: Some(20.0),
            ..Default::default()
        };
        let watcher = watcher_with(sample, WatcherParams { risk_off_confirm_wait_secs: 0, ..WatcherParams::default() });
        watcher.check_cycle().await;
        assert!(watcher.state.is_risk_off());
        assert_eq!(watcher.state.get_risk_params().risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn recovery_requires_min_wait_before_watching() {
        let sample = MacroSample::default();
        let watcher = watcher_with(sample, WatcherParams { recovery_min_wait_secs: 3600, ..WatcherParams::default() });
        watcher.state.set_risk_off(true);
        watcher.inner.write().risk_off_since = Some(Utc::now());
        watcher.run_recovery_watch().await;
        assert_eq!(watcher.inner.read().recovery_state, RecoveryState::None);
    }

    #[tokio::test]
    async fn recovery_transitions_to_recovered_once_triggers_clear() {
        let sample = MacroSample::default();
        let watcher = watcher_with(sample, WatcherParams { recovery_min_wait_secs: 0, ..WatcherParams::default() });
        watcher.state.set_risk_off(true);
        watcher.inner.write().risk_off_since = Some(Utc::now() - chrono::Duration::seconds(10));
        watcher.run_recovery_watch().await; // NONE -> WATCHING
        watcher.run_recovery_watch().await; // WATCHING -> RECOVERED
        assert_eq!(watcher.inner.read().recovery_state, RecoveryState::Recovered);
        assert!(!watcher.state.is_risk_off());
        assert_eq!(watcher.state.get_risk_params().position_pct_override, Some(0.6));
    }

    #[tokio::test]
    async fn reentry_cap_blocks_further_recovery_attempts() {
        let sample = MacroSample::default();
        let watcher = watcher_with(sample, WatcherParams { recovery_max_reentry: 0, ..WatcherParams::default() });
        watcher.state.set_risk_off(true);
        watcher.run_recovery_watch().await;
        assert_eq!(watcher.inner.read().recovery_state, RecoveryState::None);
        assert!(watcher.state.is_risk_off());
    }

    #[tokio::test]
    async fn reentry_cap_is_reset_by_reset_daily_not_lifetime() {
        let sample = MacroSample::default();
        let watcher = watcher_with(
            sample,
            WatcherParams { recovery_max_reentry: 1, recovery_min_wait_secs: 0, ..WatcherParams::default() },
        );
        watcher.state.increment_re_entry_count();
        watcher.state.set_risk_off(true);
        watcher.inner.write().risk_off_since = Some(Utc::now() - chrono::Duration::seconds(10));
        watcher.run_recovery_watch().await;
        assert_eq!(watcher.inner.read().recovery_state, RecoveryState::None, "cap from a prior day should still block before reset");

        watcher.state.reset_daily();
        watcher.run_recovery_watch().await;
        assert_eq!(watcher.inner.read().recovery_state, RecoveryState::Watching, "reset_daily must clear the re-entry cap");
    }
}
