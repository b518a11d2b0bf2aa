//! # Progress Reporting
//!
//! Read side of the coordinator and the orchestrator. A unit is one part of a
//! multipart upload or one item of a batch; a unit counts towards the
//! percentage once it has a final outcome, success or failure.
//!
//! Transfer code pushes updates into a [`ProgressTracker`]; presentation code
//! either polls [`ProgressTracker::snapshot`] or awaits changes on a
//! [`watch::Receiver`] from [`ProgressTracker::subscribe`].

use serde::Serialize;
use tokio::sync::watch;

/// Share of `completed` over `total` as a percentage in `0.0..=100.0`.
///
/// Returns `0.0` when `total` is zero.
pub fn percent(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed.min(total) as f64 / total as f64) * 100.0
}

/// Point-in-time view of one operation's progress.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub percent: f64,
    pub status: String,
}

impl ProgressSnapshot {
    fn new(label: &str, total: u64) -> Self {
        Self {
            completed: 0,
            failed: 0,
            total,
            percent: 0.0,
            status: format!("{}: waiting to start", label),
        }
    }

    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.total
    }
}

/// Publishes [`ProgressSnapshot`]s for one upload or batch run.
#[derive(Debug)]
pub struct ProgressTracker {
    label: String,
    sender: watch::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    /// # Arguments
    ///
    /// * `label` - Noun used in status lines, e.g. `"parts"` or `"uploads"`
    /// * `total` - Number of units the operation will process
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        let label = label.into();
        let (sender, _) = watch::channel(ProgressSnapshot::new(&label, total));
        Self { label, sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.sender.borrow().clone()
    }

    pub fn set_total(&self, total: u64) {
        self.update(|s| s.total = total);
    }

    /// Raises the total to `at_least` when it is lower. Used when the number
    /// of units is only known as they are recorded.
    pub fn grow_total(&self, at_least: u64) {
        self.update(|s| s.total = s.total.max(at_least));
    }

    pub fn record_success(&self) {
        self.update(|s| s.completed += 1);
    }

    pub fn record_failure(&self) {
        self.update(|s| s.failed += 1);
    }

    /// Overrides the status line, e.g. for "completing" or "aborted".
    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.sender.send_modify(|s| s.status = status);
    }

    fn update(&self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let label = &self.label;
        self.sender.send_modify(|s| {
            change(s);
            s.percent = percent(s.finished(), s.total);
            s.status = if s.failed == 0 {
                format!("{}/{} {} done", s.completed, s.total, label)
            } else {
                format!(
                    "{}/{} {} done, {} failed",
                    s.completed, s.total, label, s.failed
                )
            };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_total_reports_zero_percent() {
        let value = percent(0, 0);
        assert_eq!(value, 0.0);
        assert!(!value.is_nan());
        assert_eq!(ProgressTracker::new("parts", 0).snapshot().percent, 0.0);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(9, 4), 100.0);
    }

    #[test]
    fn failures_count_towards_progress() {
        let tracker = ProgressTracker::new("uploads", 4);
        tracker.record_success();
        tracker.record_failure();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.percent, 50.0);
        assert_eq!(snapshot.status, "1/4 uploads done, 1 failed");
        assert!(!snapshot.is_done());
    }

    #[test]
    fn grown_total_never_shrinks() {
        let tracker = ProgressTracker::new("parts", 0);
        tracker.grow_total(1);
        tracker.record_success();
        assert_eq!(tracker.snapshot().status, "1/1 parts done");

        tracker.set_total(5);
        tracker.grow_total(2);
        assert_eq!(tracker.snapshot().total, 5);
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let tracker = ProgressTracker::new("parts", 2);
        let mut rx = tracker.subscribe();

        tracker.record_success();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().completed, 1);

        tracker.record_success();
        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone();
        assert!(latest.is_done());
        assert_eq!(latest.status, "2/2 parts done");
    }
}
