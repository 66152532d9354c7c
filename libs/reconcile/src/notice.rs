//! Suppression of repeated user-facing notices.
//!
//! User-spec problems are re-evaluated on every cycle. The tracker makes the
//! matching event fire once per offending input, again whenever the input
//! changes, and again after a coarse re-report interval.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::hash::InputDigest;

/// Default re-report interval for an unchanged offending input.
pub const DEFAULT_NOTICE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Tracks which notices were reported, per subject and reason.
#[derive(Debug, Clone)]
pub struct NoticeTracker {
    /// Re-report interval.
    interval: Duration,

    /// (subject, reason) -> (input hash, last report time).
    reported: BTreeMap<(String, String), (InputDigest, Instant)>,
}

impl Default for NoticeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_INTERVAL)
    }
}

impl NoticeTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            reported: BTreeMap::new(),
        }
    }

    /// Returns true if the notice should be emitted now, and records it.
    pub fn should_report(&mut self, subject: &str, reason: &str, input: &InputDigest) -> bool {
        self.should_report_at(subject, reason, input, Instant::now())
    }

    /// Same as [`Self::should_report`] with an explicit clock.
    pub fn should_report_at(
        &mut self,
        subject: &str,
        reason: &str,
        input: &InputDigest,
        now: Instant,
    ) -> bool {
        let key = (subject.to_string(), reason.to_string());
        if let Some((reported, at)) = self.reported.get(&key) {
            if reported == input && now.duration_since(*at) < self.interval {
                return false;
            }
        }
        self.reported.insert(key, (*input, now));
        true
    }

    /// Forgets one notice, e.g. once the problem is resolved.
    pub fn clear(&mut self, subject: &str, reason: &str) {
        self.reported
            .remove(&(subject.to_string(), reason.to_string()));
    }

    /// Forgets every notice for `subject`.
    pub fn forget(&mut self, subject: &str) {
        self.reported.retain(|(s, _), _| s != subject);
    }

    pub fn len(&self) -> usize {
        self.reported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_input() {
        let mut tracker = NoticeTracker::new(Duration::from_secs(60));
        let now = Instant::now();
        let bad = InputDigest::of_str("not a schedule");

        assert!(tracker.should_report_at("default/nightly", "InvalidSchedule", &bad, now));
        assert!(!tracker.should_report_at("default/nightly", "InvalidSchedule", &bad, now));
        assert!(!tracker.should_report_at(
            "default/nightly",
            "InvalidSchedule",
            &bad,
            now + Duration::from_secs(59)
        ));

        // Other subjects and reasons are independent.
        assert!(tracker.should_report_at("default/hourly", "InvalidSchedule", &bad, now));
        assert!(tracker.should_report_at("default/nightly", "Deadline", &bad, now));
    }

    #[test]
    fn test_changed_input_reports_again() {
        let mut tracker = NoticeTracker::default();
        let now = Instant::now();
        let first = InputDigest::of_str("61 * * * *");
        let second = InputDigest::of_str("* * *");

        assert!(tracker.should_report_at("ns/a", "InvalidSchedule", &first, now));
        assert!(tracker.should_report_at("ns/a", "InvalidSchedule", &second, now));
        assert!(!tracker.should_report_at("ns/a", "InvalidSchedule", &second, now));
    }

    #[test]
    fn test_interval_elapsed_reports_again() {
        let mut tracker = NoticeTracker::new(Duration::from_secs(60));
        let now = Instant::now();
        let input = InputDigest::of_str("x");

        assert!(tracker.should_report_at("ns/a", "r", &input, now));
        assert!(tracker.should_report_at("ns/a", "r", &input, now + Duration::from_secs(60)));
    }

    #[test]
    fn test_clear_and_forget() {
        let mut tracker = NoticeTracker::default();
        let input = InputDigest::of_str("x");

        assert!(tracker.should_report("ns/a", "r1", &input));
        assert!(tracker.should_report("ns/a", "r2", &input));
        assert!(tracker.should_report("ns/b", "r1", &input));
        assert_eq!(tracker.len(), 3);

        tracker.clear("ns/a", "r1");
        assert!(tracker.should_report("ns/a", "r1", &input));

        tracker.forget("ns/a");
        assert_eq!(tracker.len(), 1);
    }
}
