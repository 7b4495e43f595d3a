use std::collections::VecDeque;
use std::time::Duration;

/// Whole milliseconds in `d`, saturating at `u64::MAX`
pub fn as_millis_u64(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Rolling average of call round-trip times for one venue
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    window: usize,
    threshold: Duration,
    samples: VecDeque<Duration>,
    total: Duration,
    high: bool,
}

/// Threshold crossing reported by [`LatencyTracker::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyTransition {
    BecameHigh { average: Duration },
    Recovered { average: Duration },
}

impl LatencyTracker {
    pub fn new(window: usize, threshold: Duration) -> Self {
        Self {
            window: window.max(1),
            threshold,
            samples: VecDeque::with_capacity(window.max(1)),
            total: Duration::ZERO,
            high: false,
        }
    }

    /// Add a sample; returns a transition when the average crosses the threshold
    pub fn record(&mut self, sample: Duration) -> Option<LatencyTransition> {
        self.samples.push_back(sample);
        self.total += sample;
        while self.samples.len() > self.window {
            if let Some(old) = self.samples.pop_front() {
                self.total -= old;
            }
        }

        let average = self.average();
        match (self.high, average > self.threshold) {
            (false, true) => {
                self.high = true;
                Some(LatencyTransition::BecameHigh { average })
            }
            (true, false) => {
                self.high = false;
                Some(LatencyTransition::Recovered { average })
            }
            _ => None,
        }
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.total / self.samples.len() as u32
    }

    pub fn is_high(&self) -> bool {
        self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_millis_saturate_instead_of_wrapping() {
        assert_eq!(as_millis_u64(ms(1500)), 1500);
        assert_eq!(as_millis_u64(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_rolling_average_crosses_threshold() {
        let mut tracker = LatencyTracker::new(4, ms(500));
        assert_eq!(tracker.record(ms(100)), None);
        assert_eq!(tracker.record(ms(100)), None);
        // (100 + 100 + 1400) / 3 = 533
        assert!(matches!(
            tracker.record(ms(1400)),
            Some(LatencyTransition::BecameHigh { .. })
        ));
        assert!(tracker.is_high());
        // Stays high without re-reporting
        assert_eq!(tracker.record(ms(600)), None);
    }

    #[test]
    fn test_window_evicts_old_samples() {
        let mut tracker = LatencyTracker::new(2, ms(500));
        tracker.record(ms(2000));
        tracker.record(ms(2000));
        assert!(tracker.is_high());
        tracker.record(ms(10));
        assert!(matches!(
            tracker.record(ms(10)),
            Some(LatencyTransition::Recovered { .. })
        ));
        assert_eq!(tracker.average(), ms(10));
    }
}
