//! Per-connection send pacing
//! Token budget granted in fixed time slices; exhausting a slice defers the sender

use std::time::{Duration, Instant};

/// Outcome of asking for send budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Send up to this many bytes now
    Send(usize),
    /// Budget exhausted; sleep until the next period boundary
    WaitUntil(Instant),
}

/// Period-quantum rate limiter.
///
/// Each period of `period` grants `rate_bytes x period / 1s` bytes (floored,
/// never below one byte so a tiny rate cannot deadlock the sender). Unused
/// budget is dropped at the boundary; every slice starts from a full quantum.
pub struct PeriodBudget {
    quantum: u64,
    period: Duration,
    remaining: u64,
    boundary: Instant,
}

impl PeriodBudget {
    pub fn new(rate_bytes_per_sec: u64, period: Duration, now: Instant) -> Self {
        let quantum =
            (rate_bytes_per_sec.saturating_mul(period.as_millis() as u64) / 1000).max(1);
        Self {
            quantum,
            period,
            remaining: quantum,
            boundary: now + period,
        }
    }

    /// Request budget for a send of `want` bytes.
    ///
    /// Grants the smaller of `want` and the remaining slice budget; with the
    /// slice spent, tells the caller when the next one opens.
    pub fn grant(&mut self, want: usize, now: Instant) -> Grant {
        self.roll_forward(now);
        if self.remaining == 0 {
            return Grant::WaitUntil(self.boundary);
        }
        let granted = (want as u64).min(self.remaining);
        self.remaining -= granted;
        Grant::Send(granted as usize)
    }

    /// Advance past any elapsed period boundaries, refreshing the quantum
    fn roll_forward(&mut self, now: Instant) {
        while now >= self.boundary {
            self.boundary += self.period;
            self.remaining = self.quantum;
        }
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PERIOD: Duration = Duration::from_millis(100);

    #[test]
    fn quantum_is_rate_share_of_period() {
        let now = Instant::now();
        // 1 MB/s over 100 ms slices = 100 KB per slice
        let budget = PeriodBudget::new(1_000_000, PERIOD, now);
        assert_eq!(budget.quantum(), 100_000);
    }

    #[test]
    fn tiny_rate_still_grants_one_byte() {
        let now = Instant::now();
        let mut budget = PeriodBudget::new(1, PERIOD, now);
        assert_eq!(budget.quantum(), 1);
        assert_eq!(budget.grant(65536, now), Grant::Send(1));
    }

    #[test]
    fn grant_clamps_to_remaining() {
        let now = Instant::now();
        let mut budget = PeriodBudget::new(1_000_000, PERIOD, now);
        assert_eq!(budget.grant(60_000, now), Grant::Send(60_000));
        // only 40 KB left in this slice
        assert_eq!(budget.grant(60_000, now), Grant::Send(40_000));
        assert_eq!(budget.grant(1, now), Grant::WaitUntil(now + PERIOD));
    }

    #[test]
    fn boundary_refreshes_quantum() {
        let now = Instant::now();
        let mut budget = PeriodBudget::new(1_000_000, PERIOD, now);
        assert_eq!(budget.grant(100_000, now), Grant::Send(100_000));
        assert!(matches!(budget.grant(1, now), Grant::WaitUntil(_)));

        let later = now + PERIOD;
        assert_eq!(budget.grant(100_000, later), Grant::Send(100_000));
    }

    #[test]
    fn leftover_budget_is_dropped_at_boundary() {
        let now = Instant::now();
        let mut budget = PeriodBudget::new(1_000_000, PERIOD, now);
        assert_eq!(budget.grant(10_000, now), Grant::Send(10_000));

        // 90 KB left unspent; after the boundary only a fresh 100 KB quantum exists
        let later = now + PERIOD;
        assert_eq!(budget.grant(200_000, later), Grant::Send(100_000));
        assert!(matches!(budget.grant(1, later), Grant::WaitUntil(_)));
    }

    #[test]
    fn missed_periods_do_not_accumulate() {
        let now = Instant::now();
        let mut budget = PeriodBudget::new(1_000_000, PERIOD, now);
        let much_later = now + PERIOD * 50;
        assert_eq!(budget.grant(1_000_000, much_later), Grant::Send(100_000));
        assert!(matches!(budget.grant(1, much_later), Grant::WaitUntil(_)));
    }

    proptest! {
        #[test]
        fn slice_never_exceeds_quantum(
            rate in 1u64..100_000_000,
            wants in prop::collection::vec(1usize..1_000_000, 1..50)
        ) {
            let now = Instant::now();
            let mut budget = PeriodBudget::new(rate, PERIOD, now);
            let quantum = budget.quantum();

            let mut granted = 0u64;
            for want in wants {
                match budget.grant(want, now) {
                    Grant::Send(n) => {
                        prop_assert!(n > 0);
                        granted += n as u64;
                    }
                    Grant::WaitUntil(at) => {
                        prop_assert_eq!(at, now + PERIOD);
                        break;
                    }
                }
            }
            prop_assert!(granted <= quantum);
        }
    }
}
