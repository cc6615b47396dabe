// src/payload.rs
// Synthetic payloads and processing latency for exercising the bridge.

use crate::message::{InquiryRequest, Quote, Subject};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::time::Duration;

/// Supplies the domain fields of requests and results.
///
/// The bridge only relies on this returning promptly; what the fields contain is up
/// to the implementation.
pub trait PayloadGenerator: Send + Sync {
    fn subject(&self) -> Subject;

    fn quote(&self, request: &InquiryRequest) -> Quote;
}

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Donald", "Edsger", "Frances", "Grace", "John", "Ken", "Radia",
];
const LAST_NAMES: &[&str] = &[
    "Allen", "Dijkstra", "Hopper", "Knuth", "Liskov", "Lovelace", "McCarthy", "Perlman",
    "Thompson", "Turing",
];
const CURRENCIES: &[&str] = &["EUR", "USD", "GBP", "JPY", "CHF", "IDR", "SGD", "AUD"];

/// Random names, dates, currencies and amounts.
#[derive(Clone, Debug, Default)]
pub struct FakePayloadGenerator;

impl PayloadGenerator for FakePayloadGenerator {
    fn subject(&self) -> Subject {
        let mut rng = rand::rng();
        let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Ada");
        let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("Lovelace");
        let date = format!(
            "{:04}-{:02}-{:02}",
            rng.random_range(1970..2030),
            rng.random_range(1..=12),
            rng.random_range(1..=28)
        );

        Subject {
            name: format!("{first} {last}"),
            date,
        }
    }

    fn quote(&self, _request: &InquiryRequest) -> Quote {
        let mut rng = rand::rng();
        let currency = CURRENCIES.choose(&mut rng).copied().unwrap_or("EUR");
        let cents: u32 = rng.random_range(0..10_000_000);

        Quote {
            currency: currency.to_string(),
            amount: f64::from(cents) / 100.0,
        }
    }
}

/// Bounds of the artificial processing latency, `[min, max)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        DelayRange { min, max }
    }

    /// No delay at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Draws a delay uniformly from the range, or `None` if the range is empty.
    pub fn sample(&self) -> Option<Duration> {
        if self.max <= self.min {
            return None;
        }

        // spans beyond u64 nanoseconds (~584 years) are sampled from the first u64::MAX ns
        let spread = u64::try_from((self.max - self.min).as_nanos()).unwrap_or(u64::MAX);
        let offset = rand::rng().random_range(0..spread);
        Some(self.min + Duration::from_nanos(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_has_no_delay() {
        assert_eq!(DelayRange::none().sample(), None);
        let inverted = DelayRange::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(inverted.sample(), None);
        let point = DelayRange::new(Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(point.sample(), None);
    }

    #[test]
    fn samples_stay_within_bounds() {
        let range = DelayRange::new(Duration::from_millis(20), Duration::from_millis(30));
        for _ in 0..1_000 {
            let delay = range.sample().unwrap();
            assert!(delay >= range.min);
            assert!(delay < range.max);
        }
    }

    #[test]
    fn oversized_range_is_not_truncated() {
        // 2^64 + 1000 ns wide: a wrapping cast would leave a spread of 1000 ns
        let max = Duration::from_nanos(u64::MAX) + Duration::from_nanos(1_001);
        let range = DelayRange::new(Duration::ZERO, max);
        for _ in 0..100 {
            let delay = range.sample().unwrap();
            assert!(delay > Duration::from_secs(1), "{delay:?}");
            assert!(delay < range.max);
        }
    }

    #[test]
    fn fake_subject_is_populated() {
        let subject = FakePayloadGenerator.subject();
        assert!(subject.name.contains(' '));
        assert_eq!(subject.date.len(), 10);
    }

    #[test]
    fn fake_quote_is_plausible() {
        let request = InquiryRequest::new("u1", FakePayloadGenerator.subject());
        let quote = FakePayloadGenerator.quote(&request);
        assert!(CURRENCIES.contains(&quote.currency.as_str()));
        assert!(quote.amount >= 0.0 && quote.amount < 100_000.0);
    }
}
