// =============================================================================
// Clock & Scheduler (C1)
// =============================================================================
//
// A single KST-authoritative clock. Named daily events fire at fixed
// wall-clock times; a periodic tick drives the strategist loop. No external
// cron crate — named events are evaluated against the teacher's
// `tokio::time::interval` polling idiom (see main.rs's periodic spawns)
// rather than pulled in as a dependency the rest of the pack doesn't use.
// =============================================================================

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use chrono_tz::Asia::Seoul;
use tracing::debug;

/// Named daily events, fixed KST wall-clock times (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DailyEvent {
    MacroReady,
    ScannerFirst,
    TradingStart,
    OpeningRushEnd,
    ScannerSecond,
    Track2Evaluation,
    Track1ForceClose,
    MarketClose,
    EndOfDayReport,
}

impl DailyEvent {
    pub fn time(self) -> NaiveTime {
        let (h, m) = match self {
            DailyEvent::MacroReady => (6, 0),
            DailyEvent::ScannerFirst => (8, 30),
            DailyEvent::TradingStart => (9, 10),
            DailyEvent::OpeningRushEnd => (9, 20),
            DailyEvent::ScannerSecond => (11, 30),
            DailyEvent::Track2Evaluation => (14, 30),
            DailyEvent::Track1ForceClose => (15, 10),
            DailyEvent::MarketClose => (15, 30),
            DailyEvent::EndOfDayReport => (15, 45),
        };
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    pub const ALL: [DailyEvent; 9] = [
        DailyEvent::MacroReady,
        DailyEvent::ScannerFirst,
        DailyEvent::TradingStart,
        DailyEvent::OpeningRushEnd,
        DailyEvent::ScannerSecond,
        DailyEvent::Track2Evaluation,
        DailyEvent::Track1ForceClose,
        DailyEvent::MarketClose,
        DailyEvent::EndOfDayReport,
    ];
}

/// Statically compiled KRX holiday set; update yearly. 2026 public holidays
/// observed by the exchange, weekends are handled separately.
fn krx_holidays_2026() -> HashSet<NaiveDate> {
    [
        (2026, 1, 1),
        (2026, 2, 16),
        (2026, 2, 17),
        (2026, 2, 18),
        (2026, 3, 1),
        (2026, 3, 2),
        (2026, 5, 5),
        (2026, 5, 24),
        (2026, 5, 25),
        (2026, 6, 6),
        (2026, 8, 15),
        (2026, 8, 17),
        (2026, 9, 24),
        (2026, 9, 25),
        (2026, 10, 3),
        (2026, 10, 5),
        (2026, 10, 9),
        (2026, 12, 25),
        (2026, 12, 31),
    ]
    .into_iter()
    .map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
    .collect()
}

/// KST wall-clock helpers plus the trading-day calendar gate.
pub struct Clock {
    holidays: HashSet<NaiveDate>,
}

impl Clock {
    pub fn new() -> Self {
        Self { holidays: krx_holidays_2026() }
    }

    pub fn now_kst(&self) -> chrono::DateTime<chrono_tz::Tz> {
        chrono::Utc::now().with_timezone(&Seoul)
    }

    pub fn now_time_kst(&self) -> NaiveTime {
        self.now_kst().time()
    }

    pub fn today_kst(&self) -> NaiveDate {
        self.now_kst().date_naive()
    }

    /// Weekday and not in the static holiday set.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday();
        let is_weekend = matches!(weekday, chrono::Weekday::Sat | chrono::Weekday::Sun);
        !is_weekend && !self.holidays.contains(&date)
    }

    pub fn is_trading_day_today(&self) -> bool {
        self.is_trading_day(self.today_kst())
    }

    /// Whether `now` has just crossed past `event`'s fixed time within the
    /// current poll window (`window_secs` wide) — used by the scheduler loop
    /// to fire each named event exactly once per day.
    pub fn event_due(&self, event: DailyEvent, now: NaiveTime, window_secs: i64) -> bool {
        let target = event.time();
        let now_secs = now.num_seconds_from_midnight() as i64;
        let target_secs = target.num_seconds_from_midnight() as i64;
        now_secs >= target_secs && now_secs < target_secs + window_secs
    }

    pub fn is_market_hours(&self, now: NaiveTime) -> bool {
        now >= DailyEvent::TradingStart.time() && now < DailyEvent::MarketClose.time()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the periodic tick loop and named-event dispatch. Each firing of a
/// `DailyEvent` runs its handler on a detached task so a slow handler never
/// blocks the scheduler; an overrun tick is skipped, never queued (spec §4.1
/// "Suspension semantics").
pub struct Scheduler {
    clock: Clock,
    fired_today: std::collections::HashSet<DailyEvent>,
    last_date: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(clock: Clock) -> Self {
        Self { clock, fired_today: HashSet::new(), last_date: None }
    }

    /// Poll once; returns the events that just became due. Resets the
    /// per-day "already fired" set when the KST calendar date rolls over.
    pub fn poll(&mut self) -> Vec<DailyEvent> {
        let today = self.clock.today_kst();
        if self.last_date != Some(today) {
            self.fired_today.clear();
            self.last_date = Some(today);
        }

        if !self.clock.is_trading_day(today) {
            return Vec::new();
        }

        let now = self.clock.now_time_kst();
        let mut due = Vec::new();
        for event in DailyEvent::ALL {
            if self.fired_today.contains(&event) {
                continue;
            }
            if self.clock.event_due(event, now, 90) {
                self.fired_today.insert(event);
                due.push(event);
            }
        }
        due
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

/// Run the scheduler's tick loop, invoking `on_event` for each named event
/// that becomes due and `on_tick` on every periodic poll (spec: "every ~1.5
/// s during market hours"). Each callback is spawned so a slow handler can't
/// stall the poll loop itself.
pub async fn run_scheduler<F, Fut, G, GFut>(
    mut scheduler: Scheduler,
    poll_interval: std::time::Duration,
    on_event: F,
    on_tick: G,
) where
    F: Fn(DailyEvent) -> Fut + Send + Sync + 'static + Clone,
    Fut: std::future::Future<Output = ()> + Send + 'static,
    G: Fn() -> GFut + Send + Sync + 'static + Clone,
    GFut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;

        if !scheduler.clock().is_trading_day_today() {
            debug!("non-trading day, scheduler idle");
            continue;
        }

        let due = scheduler.poll();
        for event in due {
            let handler = on_event.clone();
            tokio::spawn(async move { handler(event).await });
        }

        if scheduler.clock().is_market_hours(scheduler.clock().now_time_kst()) {
            let tick_handler = on_tick.clone();
            tokio::spawn(async move { tick_handler().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekend_is_not_a_trading_day() {
        let clock = Clock::new();
        let saturday = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert_eq!(saturday.weekday(), chrono::Weekday::Sat);
        assert!(!clock.is_trading_day(saturday));
    }

    #[test]
    fn holiday_is_not_a_trading_day() {
        let clock = Clock::new();
        let new_years = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(!clock.is_trading_day(new_years));
    }

    #[test]
    fn ordinary_weekday_is_a_trading_day() {
        let clock = Clock::new();
        let tuesday = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        assert!(clock.is_trading_day(tuesday));
    }

    #[test]
    fn event_due_within_window() {
        let clock = Clock::new();
        let now = NaiveTime::from_hms_opt(9, 10, 30).unwrap();
        assert!(clock.event_due(DailyEvent::TradingStart, now, 90));
        let later = NaiveTime::from_hms_opt(9, 13, 0).unwrap();
        assert!(!clock.event_due(DailyEvent::TradingStart, later, 90));
    }

    #[test]
    fn market_hours_window() {
        let clock = Clock::new();
        assert!(clock.is_market_hours(NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
        assert!(!clock.is_market_hours(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert!(!clock.is_market_hours(NaiveTime::from_hms_opt(15, 30, 0).unwrap()));
    }

    #[test]
    fn scheduler_fires_each_event_once_per_day() {
        let mut scheduler = Scheduler::new(Clock::new());
        // Force the same date by polling twice in immediate succession;
        // an event due now should only be returned once.
        let first = scheduler.poll();
        let second = scheduler.poll();
        assert!(second.iter().all(|e| !first.contains(e)));
    }
}
