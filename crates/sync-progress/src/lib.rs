//! Aggregates per-job status into overall counts without coupling to any
//! particular presentation, and the `Reporter` seam the rest of the engine
//! uses in place of `println!` for structured, leveled diagnostics.
//!
//! [`ProgressTracker`] is the only piece of mutable shared state touched by
//! every worker concurrently; a single mutex protects both the aggregate
//! counters and the per-repository map so a caller polling [`ProgressTracker::snapshot`]
//! at, say, 10 Hz never blocks a worker for longer than a map insert.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sync_types::{JobState, ProgressSnapshot, RepositoryStatus};

/// A presentation-agnostic sink for engine diagnostics. The engine is
/// generic over (or takes a trait object of) `Reporter` everywhere it would
/// otherwise print directly, so a caller can wire in `tracing`, plain
/// stdout, or nothing at all.
pub trait Reporter: Send {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards every message. The default for callers that only care about the
/// final `BulkResult`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Buffers every line in memory, tagged by level. Used by tests that want to
/// assert on what the engine reported without capturing stdout.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    pub lines: Vec<(ReportLevel, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Info,
    Warn,
    Error,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push((ReportLevel::Info, msg.to_string()));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push((ReportLevel::Warn, msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push((ReportLevel::Error, msg.to_string()));
    }
}

struct Counters {
    discovered: u64,
    pending: u64,
    running: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    per_repository: BTreeMap<String, RepositoryStatus>,
}

/// Aggregates live per-repository status into the counts a caller renders.
///
/// Every worker calls [`ProgressTracker::update_job`] (and the
/// [`ProgressTracker::complete_job`] / [`ProgressTracker::fail_job`]
/// shorthands) concurrently; a single reader calls [`ProgressTracker::snapshot`].
/// Snapshots are copies — holding one never blocks a worker's next update.
pub struct ProgressTracker {
    started_at: Instant,
    state: Mutex<Counters>,
}

impl ProgressTracker {
    /// Start a tracker seeded with `discovered` pending repositories (the
    /// full set the orchestrator is about to schedule).
    pub fn new(discovered: u64) -> Self {
        Self {
            started_at: Instant::now(),
            state: Mutex::new(Counters {
                discovered,
                pending: discovered,
                running: 0,
                succeeded: 0,
                failed: 0,
                skipped: 0,
                per_repository: BTreeMap::new(),
            }),
        }
    }

    /// Set the `discovered`/`pending` counts once discovery has completed.
    /// Intended to be called exactly once, before any `update_job` call,
    /// when a tracker was constructed with `new(0)` because the true count
    /// isn't known until after discovery runs.
    pub fn seed_discovered(&self, discovered: u64) {
        let mut counters = self.state.lock().expect("progress mutex poisoned");
        counters.discovered = discovered;
        counters.pending = discovered;
    }

    /// Record a non-terminal status change (e.g. `pending -> running`, or a
    /// percent/message update mid-operation). Moving into `JobState::Running`
    /// for the first time decrements `pending` and increments `running`.
    pub fn update_job(&self, full_name: &str, state: JobState, message: Option<String>, percent: Option<f32>) {
        let mut counters = self.state.lock().expect("progress mutex poisoned");
        let previous = counters
            .per_repository
            .get(full_name)
            .map(|s| s.state);

        if previous != Some(state) {
            adjust_counts(&mut counters, previous, state);
        }

        counters.per_repository.insert(
            full_name.to_string(),
            RepositoryStatus {
                state,
                message,
                percent,
            },
        );
    }

    /// Shorthand for a terminal success transition.
    pub fn complete_job(&self, full_name: &str, message: Option<String>) {
        self.update_job(full_name, JobState::Succeeded, message, Some(100.0));
    }

    /// Shorthand for a terminal failure transition.
    pub fn fail_job(&self, full_name: &str, error: &str) {
        self.update_job(full_name, JobState::Failed, Some(error.to_string()), None);
    }

    /// Shorthand for a terminal skip transition.
    pub fn skip_job(&self, full_name: &str, reason: &str) {
        self.update_job(full_name, JobState::Skipped, Some(reason.to_string()), None);
    }

    /// A consistent, read-only copy of the current counts and per-repository
    /// status map. `succeeded` and `failed` never go backwards within a run.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.state.lock().expect("progress mutex poisoned");
        ProgressSnapshot {
            discovered: counters.discovered,
            pending: counters.pending,
            running: counters.running,
            succeeded: counters.succeeded,
            failed: counters.failed,
            skipped: counters.skipped,
            per_repository: counters.per_repository.clone(),
        }
    }

    /// Elapsed time since the tracker was constructed.
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Move one repository between the coarse buckets as its `JobState`
/// transitions. `Retrying` is folded back into `running` for the purposes of
/// the aggregate counts — it is still in flight from the caller's point of
/// view.
fn adjust_counts(counters: &mut Counters, previous: Option<JobState>, next: JobState) {
    match previous {
        None | Some(JobState::Pending) => counters.pending = counters.pending.saturating_sub(1),
        Some(JobState::Running) | Some(JobState::Retrying) => {
            counters.running = counters.running.saturating_sub(1)
        }
        Some(JobState::Succeeded) | Some(JobState::Failed) | Some(JobState::Skipped) => {}
    }

    match next {
        JobState::Pending => counters.pending += 1,
        JobState::Running | JobState::Retrying => counters.running += 1,
        JobState::Succeeded => counters.succeeded += 1,
        JobState::Failed => counters.failed += 1,
        JobState::Skipped => counters.skipped += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_tracker_seeds_pending_from_discovered() {
        let tracker = ProgressTracker::new(5);
        let snap = tracker.snapshot();
        assert_eq!(snap.discovered, 5);
        assert_eq!(snap.pending, 5);
        assert_eq!(snap.running, 0);
    }

    #[test]
    fn seed_discovered_sets_counts_before_any_update() {
        let tracker = ProgressTracker::new(0);
        tracker.seed_discovered(7);
        let snap = tracker.snapshot();
        assert_eq!(snap.discovered, 7);
        assert_eq!(snap.pending, 7);
    }

    #[test]
    fn update_job_moves_pending_to_running_to_succeeded() {
        let tracker = ProgressTracker::new(1);
        tracker.update_job("octo/a", JobState::Running, None, None);
        let snap = tracker.snapshot();
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.running, 1);

        tracker.complete_job("octo/a", Some("cloned".into()));
        let snap = tracker.snapshot();
        assert_eq!(snap.running, 0);
        assert_eq!(snap.succeeded, 1);
    }

    #[test]
    fn fail_job_increments_failed_and_clears_running() {
        let tracker = ProgressTracker::new(1);
        tracker.update_job("octo/a", JobState::Running, None, None);
        tracker.fail_job("octo/a", "disk full");
        let snap = tracker.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.running, 0);
        assert_eq!(
            snap.per_repository.get("octo/a").unwrap().message.as_deref(),
            Some("disk full")
        );
    }

    #[test]
    fn repeated_identical_state_update_does_not_double_count() {
        let tracker = ProgressTracker::new(1);
        tracker.update_job("octo/a", JobState::Running, Some("10%".into()), Some(10.0));
        tracker.update_job("octo/a", JobState::Running, Some("50%".into()), Some(50.0));
        let snap = tracker.snapshot();
        assert_eq!(snap.running, 1);
        assert_eq!(snap.per_repository.get("octo/a").unwrap().percent, Some(50.0));
    }

    #[test]
    fn snapshot_never_goes_backwards_under_concurrent_updates() {
        let tracker = Arc::new(ProgressTracker::new(50));
        let mut handles = Vec::new();
        for i in 0..50 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                let name = format!("octo/repo-{i}");
                tracker.update_job(&name, JobState::Running, None, None);
                tracker.complete_job(&name, None);
            }));
        }
        for h in handles {
            h.join().expect("worker thread panicked");
        }

        let snap = tracker.snapshot();
        assert_eq!(snap.succeeded, 50);
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.running, 0);
    }

    #[test]
    fn duration_is_monotonically_non_decreasing() {
        let tracker = ProgressTracker::new(0);
        let first = tracker.duration();
        thread::sleep(Duration::from_millis(5));
        let second = tracker.duration();
        assert!(second >= first);
    }

    #[test]
    fn collecting_reporter_buffers_all_levels() {
        let mut reporter = CollectingReporter::default();
        reporter.info("starting");
        reporter.warn("slow page");
        reporter.error("auth rejected");
        assert_eq!(reporter.lines.len(), 3);
        assert_eq!(reporter.lines[0].0, ReportLevel::Info);
        assert_eq!(reporter.lines[2].0, ReportLevel::Error);
    }

    #[test]
    fn null_reporter_discards_everything() {
        let mut reporter = NullReporter;
        reporter.info("noop");
        reporter.warn("noop");
        reporter.error("noop");
    }
}
