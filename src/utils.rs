//! Utility functions for record ids and timestamps

use chrono::{DateTime, TimeZone, Utc};
use uuid7::uuid7;

// uuid7 text sorts in creation order, so ids double as a tie-breaker for equal timestamps
pub fn new_record_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid7())
}

/// A fresh correlation id for one call tree.
pub fn new_request_id() -> String {
    uuid7().to_string()
}

/// Wall-clock source for record timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant. Handy for asserting on stored records.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn at_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_carry_prefix_and_sort_in_creation_order() {
        let a = new_record_id("log_");
        let b = new_record_id("log_");

        assert!(a.starts_with("log_"));
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn fixed_clock_is_stable() {
        let clock = FixedClock::at_millis(1_700_000_000_000);
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().timestamp_millis(), 1_700_000_000_000);
    }
}
