use rand::Rng;
use rand::seq::IndexedRandom;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Uniform random duration in `range`, at millisecond resolution.
pub fn jitter(range: &RangeInclusive<Duration>) -> Duration {
    let lo = range.start().as_millis() as u64;
    let hi = range.end().as_millis() as u64;
    if lo >= hi {
        return *range.start();
    }
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

/// Flat, jittered delay between reconnect attempts. Not exponential: the
/// spread alone keeps a large population from retrying in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    range: RangeInclusive<Duration>,
}

impl Backoff {
    pub fn new(range: RangeInclusive<Duration>) -> Self {
        let min = (*range.start()).max(Duration::from_millis(1));
        let max = (*range.end()).max(min);
        Self { range: min..=max }
    }

    pub fn delay(&self) -> Duration {
        jitter(&self.range)
    }
}

/// Client-side hiccups a live session may simulate after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disruption {
    NetworkLag,
    TabSwitch,
    MobileBackground,
}

impl Disruption {
    const ALL: [Disruption; 3] = [
        Disruption::NetworkLag,
        Disruption::TabSwitch,
        Disruption::MobileBackground,
    ];

    pub fn pause_range(self) -> RangeInclusive<Duration> {
        match self {
            Disruption::NetworkLag => Duration::from_secs(2)..=Duration::from_secs(8),
            Disruption::TabSwitch => Duration::from_millis(500)..=Duration::from_secs(2),
            Disruption::MobileBackground => Duration::from_secs(10)..=Duration::from_secs(30),
        }
    }

    pub fn pause(self) -> Duration {
        jitter(&self.pause_range())
    }

    pub fn label(self) -> &'static str {
        match self {
            Disruption::NetworkLag => "network lag",
            Disruption::TabSwitch => "tab switch",
            Disruption::MobileBackground => "mobile background",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DisruptionPolicy {
    probability: f64,
}

impl DisruptionPolicy {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn never() -> Self {
        Self::new(0.0)
    }

    /// Rolled once per received message.
    pub fn roll(&self) -> Option<Disruption> {
        let mut rng = rand::rng();
        if !rng.random_bool(self.probability) {
            return None;
        }
        Disruption::ALL.choose(&mut rng).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_range() {
        let backoff = Backoff::new(Duration::from_secs(1)..=Duration::from_secs(3));
        for _ in 0..1_000 {
            let delay = backoff.delay();
            assert!(delay >= Duration::from_secs(1), "{:?}", delay);
            assert!(delay <= Duration::from_secs(3), "{:?}", delay);
        }
    }

    #[test]
    fn zero_minimum_is_lifted() {
        let backoff = Backoff::new(Duration::ZERO..=Duration::ZERO);
        assert_eq!(backoff.delay(), Duration::from_millis(1));
    }

    #[test]
    fn degenerate_range_yields_its_bound() {
        let d = Duration::from_millis(250);
        assert_eq!(jitter(&(d..=d)), d);
    }

    #[test]
    fn disruption_pauses_stay_within_their_ranges() {
        for kind in Disruption::ALL {
            let range = kind.pause_range();
            for _ in 0..100 {
                assert!(range.contains(&kind.pause()), "{}", kind.label());
            }
        }
    }

    #[test]
    fn certain_and_impossible_policies() {
        assert_eq!(DisruptionPolicy::never().roll(), None);
        assert!(DisruptionPolicy::new(1.0).roll().is_some());
        // out-of-range input is clamped instead of panicking in random_bool
        assert!(DisruptionPolicy::new(7.0).roll().is_some());
    }
}
