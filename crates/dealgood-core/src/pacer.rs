use std::time::Duration;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Steady dispatch clock: one tick per `1/rate`, computed in integer microseconds.
///
/// A tick that arrives late fires once; missed ticks are skipped rather than
/// replayed as a burst.
pub struct Pacer {
    ticker: Interval,
}

impl Pacer {
    pub fn new(rate: u64) -> Self {
        let period = Self::period_for(rate);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker }
    }

    /// Inter-arrival interval for `rate` requests per second, at least 1µs.
    pub fn period_for(rate: u64) -> Duration {
        let rate = rate.max(1);
        Duration::from_micros((MICROS_PER_SECOND / rate).max(1))
    }

    /// Wait for the next tick. The first tick completes immediately.
    pub async fn tick(&mut self) -> Instant {
        self.ticker.tick().await
    }
}
