//! The store's notion of "now" and of the cutoff instant.
//!
//! Every instant the store compares is first truncated to millisecond
//! precision, so a value written and read back through any backend lands
//! on the same side of the cutoff.

use chrono::{DateTime, Duration, Utc};

use crate::config::StoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NowSource {
    System,
    Frozen(DateTime<Utc>),
}

/// Supplies "now" and classifies instants against the cutoff.
///
/// The cutoff is `now + cutoff_offset + buffer`: everything at or before
/// it is considered committed to processing and must never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    source: NowSource,
    cutoff_offset: Duration,
}

impl Default for Clock {
    fn default() -> Self {
        Self::system(StoreConfig::default().cutoff_offset())
    }
}

impl Clock {
    /// A clock backed by the system wall clock.
    pub fn system(cutoff_offset: Duration) -> Self {
        Self {
            source: NowSource::System,
            cutoff_offset,
        }
    }

    /// A clock whose "now" never advances. Used for replays and tests.
    pub fn frozen(now: DateTime<Utc>, cutoff_offset: Duration) -> Self {
        Self {
            source: NowSource::Frozen(normalize(now)),
            cutoff_offset,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::system(config.cutoff_offset())
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.source, NowSource::Frozen(_))
    }

    pub fn cutoff_offset(&self) -> Duration {
        self.cutoff_offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.source {
            NowSource::System => normalize(Utc::now()),
            NowSource::Frozen(at) => at,
        }
    }

    /// `now + cutoff_offset + buffer`. `buffer` may be negative.
    pub fn cutoff(&self, buffer: Duration) -> DateTime<Utc> {
        shift(shift(self.now(), self.cutoff_offset), buffer)
    }

    /// Is `t` strictly after `cutoff(buffer)`?
    pub fn after_cutoff(&self, t: DateTime<Utc>, buffer: Duration) -> bool {
        normalize(t) > self.cutoff(buffer)
    }
}

/// Truncate (never round) to whole milliseconds.
pub fn normalize(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// Saturating `t + d`.
pub(crate) fn shift(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_add_signed(d).unwrap_or(if d < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn normalize_truncates_sub_millisecond_precision() {
        let t = dt("2024-05-01T12:00:00.123999Z");
        assert_eq!(normalize(t), dt("2024-05-01T12:00:00.123Z"));
    }

    #[test]
    fn normalize_truncates_towards_the_past_before_epoch() {
        let t = dt("1969-12-31T23:59:59.999900Z");
        assert_eq!(normalize(t), dt("1969-12-31T23:59:59.999Z"));
    }

    #[test]
    fn frozen_clock_cutoff_includes_offset_and_buffer() {
        let now = dt("2024-05-01T12:00:00Z");
        let clock = Clock::frozen(now, Duration::hours(1));
        assert_eq!(clock.now(), now);
        assert_eq!(clock.cutoff(Duration::zero()), dt("2024-05-01T13:00:00Z"));
        assert_eq!(
            clock.cutoff(Duration::seconds(-30)),
            dt("2024-05-01T12:59:30Z")
        );
    }

    #[test]
    fn after_cutoff_is_strict() {
        let clock = Clock::frozen(dt("2024-05-01T12:00:00Z"), Duration::hours(1));
        let cutoff = clock.cutoff(Duration::zero());
        assert!(!clock.after_cutoff(cutoff, Duration::zero()));
        assert!(clock.after_cutoff(
            cutoff + Duration::milliseconds(1),
            Duration::zero()
        ));
        // Sub-millisecond excess is truncated away.
        assert!(!clock.after_cutoff(
            cutoff + Duration::microseconds(900),
            Duration::zero()
        ));
    }

    #[test]
    fn system_clock_is_millisecond_aligned() {
        let clock = Clock::default();
        assert!(!clock.is_frozen());
        assert_eq!(clock.now().timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn shift_saturates() {
        assert_eq!(
            shift(DateTime::<Utc>::MAX_UTC, Duration::hours(1)),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(
            shift(DateTime::<Utc>::MIN_UTC, Duration::hours(-1)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
