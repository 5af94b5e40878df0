//! Dispatches a fixed set of [`Job`]s across exactly `concurrency` worker
//! threads draining a shared, bounded queue.
//!
//! There is no suspension inside the scheduler itself once a slot is free —
//! every suspension point (network I/O, `git` subprocesses, rate-limit
//! sleeps) lives inside the `worker` callback. Completion order across jobs
//! is unspecified; callers must not rely on it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use sync_types::{CancellationToken, EngineError, Job, JobState, Outcome};

/// Hard upper bound on `concurrency`.
pub const MAX_CONCURRENCY: usize = 50;
/// Default concurrency when a caller does not specify one.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Invoked once per job as it moves through a non-terminal or terminal
/// state, so a caller can drive a [`sync_progress::ProgressTracker`] and
/// debounce checkpoint saves without polling.
pub trait SchedulerObserver: Send + Sync {
    /// The job has been dispatched to a worker and begun its first attempt.
    fn on_started(&self, job: &Job) {
        let _ = job;
    }
    /// A retryable failure occurred and the job will be retried in place.
    fn on_retry(&self, job: &Job) {
        let _ = job;
    }
    /// The job has reached a terminal state (`succeeded`, `failed`, or
    /// `skipped`).
    fn on_terminal(&self, job: &Job);
}

/// A no-op observer for callers that only need the final `Vec<Job>`.
pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {
    fn on_terminal(&self, _job: &Job) {}
}

pub struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    /// Clamp `concurrency` into `[1, MAX_CONCURRENCY]`. A caller-provided `0`
    /// is treated as the default rather than a configuration error, mirroring
    /// how most CLI flags with a numeric default handle an unset value.
    pub fn new(concurrency: usize) -> Self {
        let bounded = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency.min(MAX_CONCURRENCY)
        };
        Self {
            concurrency: bounded,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `worker(ctx, job)` for each of `jobs`, at most `self.concurrency`
    /// in flight at any time, returning every job once it has reached a
    /// terminal state.
    ///
    /// Retryable failures (`EngineError::is_retryable`) are retried in place
    /// by the same worker, up to `retry_budget` additional attempts, with a
    /// brief backoff between them; exhausting the budget or hitting a
    /// non-retryable error is terminal. A panic inside `worker` is recovered
    /// and reported as an `EngineError::Internal("worker panicked")` failure
    /// rather than poisoning the scheduler for the other jobs.
    ///
    /// On cancellation, no new job is dispatched: anything still queued when
    /// `ctx` is observed cancelled is marked `skipped` with reason
    /// `"cancelled"` and in-flight workers are given the chance to notice
    /// `ctx` at their next attempt boundary. The scheduler always drains —
    /// it returns only once every worker thread has exited.
    pub fn run<W>(
        &self,
        ctx: &CancellationToken,
        jobs: Vec<Job>,
        retry_budget: u32,
        worker: W,
        observer: &dyn SchedulerObserver,
    ) -> Vec<Job>
    where
        W: Fn(&CancellationToken, &Job) -> Result<Outcome, EngineError> + Send + Sync,
    {
        let queue_capacity = self.concurrency.saturating_mul(2).max(1);
        let (tx, rx) = crossbeam_channel::bounded::<Job>(queue_capacity);
        let results = Mutex::new(Vec::with_capacity(jobs.len()));
        let worker = &worker;

        thread::scope(|scope| {
            for _ in 0..self.concurrency {
                let rx = rx.clone();
                let results = &results;
                scope.spawn(move || {
                    while let Ok(mut job) = rx.recv() {
                        run_one(ctx, &mut job, retry_budget, worker, observer);
                        results.lock().expect("scheduler results mutex poisoned").push(job);
                    }
                });
            }

            for job in jobs {
                if ctx.is_cancelled() {
                    let skipped = skip_for_cancellation(job);
                    observer.on_terminal(&skipped);
                    results
                        .lock()
                        .expect("scheduler results mutex poisoned")
                        .push(skipped);
                    continue;
                }
                // A full queue blocks here rather than growing unboundedly,
                // which bounds memory use against a large discovery set.
                if tx.send(job).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        results.into_inner().expect("scheduler results mutex poisoned")
    }
}

fn skip_for_cancellation(mut job: Job) -> Job {
    job.state = JobState::Skipped;
    job.last_error = Some("cancelled".to_string());
    job.ended_at = Some(Utc::now());
    job
}

fn run_one<W>(
    ctx: &CancellationToken,
    job: &mut Job,
    retry_budget: u32,
    worker: &W,
    observer: &dyn SchedulerObserver,
) where
    W: Fn(&CancellationToken, &Job) -> Result<Outcome, EngineError> + Send + Sync,
{
    job.started_at = Some(Utc::now());
    job.state = JobState::Running;
    observer.on_started(job);

    loop {
        if ctx.is_cancelled() {
            job.state = JobState::Skipped;
            job.last_error = Some("cancelled".to_string());
            job.ended_at = Some(Utc::now());
            observer.on_terminal(job);
            return;
        }

        job.attempt += 1;
        let attempt_result = catch_unwind(AssertUnwindSafe(|| worker(ctx, job)));

        match attempt_result {
            Ok(Ok(outcome)) => {
                job.outcome = Some(outcome);
                job.state = if outcome == Outcome::Skipped {
                    JobState::Skipped
                } else {
                    JobState::Succeeded
                };
                job.ended_at = Some(Utc::now());
                observer.on_terminal(job);
                return;
            }
            Ok(Err(err)) => {
                if err.is_retryable() && job.attempt <= retry_budget {
                    job.state = JobState::Retrying;
                    job.last_error = Some(err.to_string());
                    observer.on_retry(job);
                    let backoff = sync_retry::calculate_delay(
                        &sync_retry::RetryStrategyConfig::job_default(),
                        job.attempt,
                    );
                    ctx.sleep_interruptible(backoff);
                    continue;
                }
                job.state = JobState::Failed;
                job.last_error = Some(err.to_string());
                job.ended_at = Some(Utc::now());
                observer.on_terminal(job);
                return;
            }
            Err(_panic) => {
                job.state = JobState::Failed;
                job.last_error = Some(EngineError::Internal("worker panicked".into()).to_string());
                job.ended_at = Some(Utc::now());
                observer.on_terminal(job);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sync_types::{ProviderKind, Repository, Strategy, Visibility};

    fn sample_job(name: &str) -> Job {
        let repo = Repository {
            provider: ProviderKind::GitHub,
            owner: "octo".into(),
            name: name.into(),
            https_clone_url: format!("https://github.com/octo/{name}.git"),
            ssh_clone_url: format!("git@github.com:octo/{name}.git"),
            default_branch: "main".into(),
            visibility: Visibility::Public,
            archived: false,
            fork: false,
            language: None,
            size_kb: 0,
            stars: 0,
            topics: vec![],
            updated_at: Utc::now(),
        };
        Job::new(repo, Strategy::Reset, PathBuf::from(format!("/tmp/{name}")))
    }

    #[test]
    fn new_clamps_concurrency_to_max() {
        let scheduler = Scheduler::new(1000);
        assert_eq!(scheduler.concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn new_treats_zero_as_default() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.concurrency(), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn run_dispatches_every_job_to_a_terminal_state() {
        let scheduler = Scheduler::new(3);
        let ctx = CancellationToken::new();
        let jobs: Vec<Job> = (0..10).map(|i| sample_job(&format!("r{i}"))).collect();

        let results = scheduler.run(
            &ctx,
            jobs,
            3,
            |_ctx, _job| Ok(Outcome::Cloned),
            &NoopObserver,
        );

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|j| j.state == JobState::Succeeded));
    }

    #[test]
    fn run_never_exceeds_concurrency_in_flight() {
        let scheduler = Scheduler::new(4);
        let ctx = CancellationToken::new();
        let jobs: Vec<Job> = (0..20).map(|i| sample_job(&format!("r{i}"))).collect();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let in_flight_worker = Arc::clone(&in_flight);
        let peak_worker = Arc::clone(&peak);

        let results = scheduler.run(
            &ctx,
            jobs,
            0,
            move |_ctx, _job| {
                let now = in_flight_worker.fetch_add(1, Ordering::SeqCst) + 1;
                peak_worker.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                in_flight_worker.fetch_sub(1, Ordering::SeqCst);
                Ok(Outcome::Cloned)
            },
            &NoopObserver,
        );

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn run_retries_up_to_budget_then_succeeds() {
        let scheduler = Scheduler::new(1);
        let ctx = CancellationToken::new();
        let jobs = vec![sample_job("flaky")];
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_worker = Arc::clone(&calls);

        let results = scheduler.run(
            &ctx,
            jobs,
            3,
            move |_ctx, _job| {
                let n = calls_worker.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(EngineError::Transient("dns blip".into()))
                } else {
                    Ok(Outcome::Updated)
                }
            },
            &NoopObserver,
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, JobState::Succeeded);
        assert_eq!(results[0].attempt, 3);
    }

    #[test]
    fn run_exhausts_retry_budget_and_reports_failure() {
        let scheduler = Scheduler::new(1);
        let ctx = CancellationToken::new();
        let jobs = vec![sample_job("always-fails")];

        let results = scheduler.run(
            &ctx,
            jobs,
            2,
            |_ctx, _job| Err(EngineError::Transient("still down".into())),
            &NoopObserver,
        );

        assert_eq!(results[0].state, JobState::Failed);
        assert_eq!(results[0].attempt, 3);
    }

    #[test]
    fn run_does_not_retry_non_retryable_errors() {
        let scheduler = Scheduler::new(1);
        let ctx = CancellationToken::new();
        let jobs = vec![sample_job("conflict")];
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_worker = Arc::clone(&calls);

        let results = scheduler.run(
            &ctx,
            jobs,
            5,
            move |_ctx, _job| {
                calls_worker.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::ConflictingDirectory { path: "x".into() })
            },
            &NoopObserver,
        );

        assert_eq!(results[0].state, JobState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_recovers_from_worker_panic() {
        let scheduler = Scheduler::new(2);
        let ctx = CancellationToken::new();
        let jobs = vec![sample_job("ok"), sample_job("panics")];

        let results = scheduler.run(
            &ctx,
            jobs,
            0,
            |_ctx, job| {
                if job.full_name() == "octo/panics" {
                    panic!("boom");
                }
                Ok(Outcome::Cloned)
            },
            &NoopObserver,
        );

        assert_eq!(results.len(), 2);
        let panicked = results.iter().find(|j| j.full_name() == "octo/panics").unwrap();
        assert_eq!(panicked.state, JobState::Failed);
        assert!(panicked.last_error.as_deref().unwrap().contains("panicked"));
        let ok = results.iter().find(|j| j.full_name() == "octo/ok").unwrap();
        assert_eq!(ok.state, JobState::Succeeded);
    }

    #[test]
    fn run_skips_undispatched_jobs_on_cancellation() {
        let scheduler = Scheduler::new(1);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let jobs = vec![sample_job("a"), sample_job("b")];

        let results = scheduler.run(&ctx, jobs, 0, |_ctx, _job| Ok(Outcome::Cloned), &NoopObserver);

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|j| j.state == JobState::Skipped));
        assert!(results.iter().all(|j| j.last_error.as_deref() == Some("cancelled")));
    }

    #[test]
    fn run_cancelled_mid_flight_drains_in_flight_workers() {
        let scheduler = Scheduler::new(2);
        let ctx = CancellationToken::new();
        let jobs: Vec<Job> = (0..6).map(|i| sample_job(&format!("r{i}"))).collect();
        let ctx_for_cancel = ctx.clone();

        let results = scheduler.run(
            &ctx,
            jobs,
            0,
            move |ctx, _job| {
                if !ctx_for_cancel.is_cancelled() {
                    ctx_for_cancel.cancel();
                }
                Ok(Outcome::Cloned)
            },
            &NoopObserver,
        );

        assert_eq!(results.len(), 6);
        assert!(results.iter().any(|j| j.state == JobState::Skipped));
    }

    #[test]
    fn skipped_outcome_maps_to_skipped_job_state() {
        let scheduler = Scheduler::new(1);
        let ctx = CancellationToken::new();
        let jobs = vec![sample_job("skip-me")];

        let results = scheduler.run(&ctx, jobs, 0, |_ctx, _job| Ok(Outcome::Skipped), &NoopObserver);

        assert_eq!(results[0].state, JobState::Skipped);
    }
}
