//! Top-level composition: discover repositories across platform configs,
//! filter them, seed a checkpoint per `(provider, organization)`, and drive
//! the [`crate::scheduler::Scheduler`] to reconcile every target directory.
//!
//! This is the only module that knows about all seven other crates at once;
//! everything it does is gluing their narrower contracts together.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use sync_filter::apply as apply_filter;
use sync_git::GitExecutor;
use sync_progress::{ProgressTracker, Reporter};
use sync_providers::{ProviderClient, client_for};
use sync_retry::RetryStrategyConfig;
use sync_state::CheckpointStore;
use sync_types::{
    AuthMode, BulkResult, CancellationToken, Checkpoint, EngineError, FailedRepository, Filter,
    Job, JobState, PlatformConfig, ProviderKind, Repository, Strategy, Visibility,
};

use crate::scheduler::{Scheduler, SchedulerObserver};

/// Where a job's target directory is computed from its repository's
/// `(owner, name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryLayout {
    /// `<output>/<provider>/<owner>/<name>`.
    #[default]
    Hierarchical,
    /// `<output>/<owner-with-slashes-dashed>-<name>`, for callers that want a
    /// single flat directory regardless of how deep a group nests.
    Flat,
}

/// Everything `bulk_clone` needs beyond what each [`PlatformConfig`] already
/// carries.
#[derive(Debug, Clone)]
pub struct BulkCloneRequest {
    pub platforms: Vec<PlatformConfig>,
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub strategy: Strategy,
    pub filter: Filter,
    /// When `true` and `filter.visibility` is empty, only public
    /// repositories are discovered. Ignored if `filter.visibility` is
    /// already non-empty.
    pub include_private: bool,
    pub retry_budget: u32,
    pub auth_mode: AuthMode,
    pub layout: DirectoryLayout,
    pub git_timeout: Duration,
    /// Resume a previously checkpointed run instead of discovering anew.
    /// When set, exactly one entry of `platforms` must match the
    /// checkpoint's provider; its token is used to re-fetch each pending
    /// repository individually.
    pub resume_checkpoint_id: Option<String>,
}

impl Default for BulkCloneRequest {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            output_dir: PathBuf::from("."),
            concurrency: crate::scheduler::DEFAULT_CONCURRENCY,
            strategy: Strategy::default(),
            filter: Filter::default(),
            include_private: true,
            retry_budget: 3,
            auth_mode: AuthMode::HttpsToken,
            layout: DirectoryLayout::default(),
            git_timeout: sync_git::DEFAULT_GIT_TIMEOUT,
            resume_checkpoint_id: None,
        }
    }
}

/// Drives checkpointing, discovery, filtering, and scheduling for one bulk
/// synchronization run. Stateless beyond the checkpoint store's base
/// directory; safe to reuse across runs.
pub struct Orchestrator {
    checkpoint_store: CheckpointStore,
}

impl Orchestrator {
    pub fn new(checkpoint_store: CheckpointStore) -> Self {
        Self { checkpoint_store }
    }

    /// List every checkpoint the store currently holds, newest first.
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.checkpoint_store.list()?;
        checkpoints.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(checkpoints)
    }

    /// Remove a checkpoint by its `<provider>__<organization>` id. A no-op if
    /// it doesn't exist.
    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let (provider, organization) = parse_checkpoint_id(checkpoint_id)
            .ok_or_else(|| anyhow::anyhow!("malformed checkpoint id: {checkpoint_id}"))?;
        self.checkpoint_store.delete(provider, &organization)
    }

    /// Run (or resume) a bulk clone/sync. Blocks until every job reaches a
    /// terminal state or `ctx` is cancelled.
    pub fn bulk_clone(
        &self,
        ctx: &CancellationToken,
        request: &BulkCloneRequest,
        progress: &ProgressTracker,
        reporter: &mut dyn Reporter,
    ) -> Result<BulkResult> {
        if request.platforms.is_empty() {
            bail!("invalid configuration: at least one platform must be configured");
        }
        std::fs::create_dir_all(&request.output_dir).map_err(|e| {
            anyhow::anyhow!(
                "invalid configuration: cannot create output directory {}: {e}",
                request.output_dir.display()
            )
        })?;

        let effective_filter = effective_filter(request);

        let units = if let Some(checkpoint_id) = &request.resume_checkpoint_id {
            self.resume_units(checkpoint_id, request)?
        } else {
            self.discover_units(ctx, request, &effective_filter, reporter)?
        };

        let partial_errors: Vec<String> = units.iter().flat_map(|u| u.errors.clone()).collect();
        let mut jobs = Vec::new();
        let mut job_org: HashMap<String, usize> = HashMap::new();
        let mut seen_targets: HashSet<PathBuf> = HashSet::new();

        for (idx, unit) in units.iter().enumerate() {
            for job in &unit.jobs {
                if !seen_targets.insert(job.target_dir.clone()) {
                    bail!(
                        "invalid configuration: two repositories resolve to the same target directory {}",
                        job.target_dir.display()
                    );
                }
                job_org.insert(job.full_name(), idx);
            }
            jobs.extend(unit.jobs.iter().cloned());
        }

        let discovered = jobs.len() as u64;
        progress.seed_discovered(discovered);

        let coordinators: HashMap<usize, CheckpointCoordinator> = units
            .iter()
            .enumerate()
            .map(|(idx, unit)| (idx, CheckpointCoordinator::new(self.checkpoint_store.clone(), unit.checkpoint.clone())))
            .collect();

        for coordinator in coordinators.values() {
            coordinator.flush_initial()?;
        }

        let git = GitExecutor::new(
            request.git_timeout,
            RetryStrategyConfig {
                strategy: sync_retry::RetryStrategyType::Immediate,
                max_attempts: 1,
                base_delay: Duration::from_secs(0),
                max_delay: Duration::from_secs(0),
                jitter: 0.0,
            },
        );
        let clients: HashMap<ProviderKind, Box<dyn ProviderClient>> = request
            .platforms
            .iter()
            .map(|p| client_for(p).map(|c| (p.provider, c)))
            .collect::<Result<_>>()?;
        let auth_mode = request.auth_mode;

        let worker = move |ctx: &CancellationToken, job: &Job| -> std::result::Result<sync_types::Outcome, EngineError> {
            let client = clients.get(&job.repository.provider).ok_or_else(|| {
                EngineError::Internal(format!(
                    "no provider client configured for {}",
                    job.repository.provider
                ))
            })?;
            let auth_url = client.clone_url(&job.repository, auth_mode);
            git.execute(
                ctx,
                &job.target_dir,
                &auth_url,
                &job.repository.default_branch,
                job.strategy,
                job.repository.provider,
            )
        };

        let observer = CheckpointObserver {
            progress,
            reporter: Mutex::new(reporter),
            job_org: &job_org,
            coordinators: &coordinators,
        };

        let scheduler = Scheduler::new(request.concurrency);
        let finished = scheduler.run(ctx, jobs, request.retry_budget, worker, &observer);

        for coordinator in coordinators.values() {
            coordinator.flush_final()?;
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut cancelled = ctx.is_cancelled();

        for job in &finished {
            match job.state {
                JobState::Succeeded => succeeded.push(job.full_name()),
                JobState::Failed => failed.push(FailedRepository {
                    full_name: job.full_name(),
                    error: job.last_error.clone().unwrap_or_default(),
                }),
                JobState::Skipped => {
                    if job.last_error.as_deref() == Some("cancelled") {
                        cancelled = true;
                    }
                    skipped.push(job.full_name());
                }
                JobState::Pending | JobState::Running | JobState::Retrying => {
                    // The scheduler never returns a job in a non-terminal state.
                    failed.push(FailedRepository {
                        full_name: job.full_name(),
                        error: "job did not reach a terminal state".to_string(),
                    });
                }
            }
        }

        let remaining_ids: Vec<String> = coordinators
            .values()
            .map(|c| c.retain_if_incomplete())
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let checkpoint_id = if remaining_ids.is_empty() {
            None
        } else {
            Some(remaining_ids.join(";"))
        };

        Ok(BulkResult {
            discovered,
            succeeded,
            failed,
            skipped,
            cancelled,
            duration: Some(progress.duration()),
            checkpoint_id,
            partial_errors,
        })
    }

    fn resume_units(&self, checkpoint_id: &str, request: &BulkCloneRequest) -> Result<Vec<Unit>> {
        let (provider, organization) = parse_checkpoint_id(checkpoint_id)
            .ok_or_else(|| anyhow::anyhow!("malformed checkpoint id: {checkpoint_id}"))?;
        let mut checkpoint = self
            .checkpoint_store
            .load(provider, &organization)?
            .ok_or_else(|| anyhow::anyhow!("no checkpoint found for {checkpoint_id}"))?;

        let platform = request
            .platforms
            .iter()
            .find(|p| p.provider == provider)
            .ok_or_else(|| {
                anyhow::anyhow!("resuming {checkpoint_id} requires a platform config for {provider}")
            })?;
        let client = client_for(platform)?;

        // A repository that never reconciled successfully is eligible for
        // retry on resume, whether it was left `pending` (interrupted) or
        // `failed` (ran out of retries): the entire point of resuming is to
        // give it another attempt. `failed` is cleared here and rebuilt from
        // scratch as this resumed run concludes.
        let retry_names: Vec<String> = checkpoint
            .pending
            .drain(..)
            .chain(checkpoint.failed.drain(..).map(|f| f.full_name))
            .collect();

        let mut jobs = Vec::new();
        let mut pending = Vec::new();
        let mut errors = Vec::new();
        for full_name in &retry_names {
            let Some((owner, name)) = full_name.split_once('/') else {
                errors.push(format!("malformed checkpoint entry: {full_name}"));
                continue;
            };
            match client.get_repository(owner, name) {
                Ok(Some(repo)) => {
                    let target_dir = target_dir_for(&checkpoint.target_path, request.layout, &repo);
                    pending.push(full_name.clone());
                    jobs.push(Job::new(repo, checkpoint.strategy, target_dir));
                }
                Ok(None) => errors.push(format!("{full_name} no longer visible or was deleted")),
                Err(e) => errors.push(format!("{full_name}: {e:#}")),
            }
        }
        checkpoint.pending = pending;
        checkpoint.updated_at = Utc::now();

        Ok(vec![Unit {
            checkpoint,
            jobs,
            errors,
        }])
    }

    fn discover_units(
        &self,
        ctx: &CancellationToken,
        request: &BulkCloneRequest,
        filter: &Filter,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<Unit>> {
        let mut units = Vec::new();
        let mut seen_full_names: HashSet<(ProviderKind, String)> = HashSet::new();

        for platform in &request.platforms {
            if ctx.is_cancelled() {
                break;
            }
            let client = match client_for(platform) {
                Ok(c) => c,
                Err(e) => {
                    reporter.error(&format!("failed to build client for {}: {e:#}", platform.provider));
                    continue;
                }
            };

            for organization in &platform.organizations {
                if ctx.is_cancelled() {
                    break;
                }
                let repos = match client.list_repositories(ctx, organization) {
                    Ok(r) => r,
                    Err(e) => {
                        let auth_failure = is_auth_failure(&e);
                        reporter.error(&format!(
                            "discovery failed for {} organization {organization}: {e:#}",
                            platform.provider
                        ));
                        if auth_failure {
                            // Credentials are bad for this whole platform config; further
                            // organizations under it will fail the same way.
                            break;
                        }
                        continue;
                    }
                };

                let filtered = apply_filter(&repos, filter, platform.skip_archived, platform.skip_forked);
                let mut pending = Vec::new();
                let mut jobs = Vec::new();
                for repo in filtered {
                    let key = (repo.provider, repo.full_name());
                    if !seen_full_names.insert(key) {
                        continue;
                    }
                    let target_dir = target_dir_for(&request.output_dir, request.layout, &repo);
                    pending.push(repo.full_name());
                    jobs.push(Job::new(repo, request.strategy, target_dir));
                }

                let checkpoint = Checkpoint::new(
                    platform.provider,
                    organization.clone(),
                    request.output_dir.clone(),
                    request.strategy,
                    request.concurrency,
                    request.retry_budget,
                    pending,
                );

                units.push(Unit {
                    checkpoint,
                    jobs,
                    errors: Vec::new(),
                });
            }
        }

        Ok(units)
    }
}

/// One `(provider, organization)` checkpoint's worth of discovered work.
struct Unit {
    checkpoint: Checkpoint,
    jobs: Vec<Job>,
    errors: Vec<String>,
}

fn effective_filter(request: &BulkCloneRequest) -> Filter {
    let mut filter = request.filter.clone();
    if !request.include_private && filter.visibility.is_empty() {
        filter.visibility = vec![Visibility::Public];
    }
    filter
}

fn target_dir_for(output_dir: &Path, layout: DirectoryLayout, repo: &Repository) -> PathBuf {
    match layout {
        DirectoryLayout::Hierarchical => output_dir
            .join(repo.provider.to_string())
            .join(&repo.owner)
            .join(&repo.name),
        DirectoryLayout::Flat => {
            let flat_owner = repo.owner.replace('/', "-");
            output_dir.join(format!("{flat_owner}-{}", repo.name))
        }
    }
}

fn is_auth_failure(err: &anyhow::Error) -> bool {
    format!("{err:#}").to_lowercase().contains("authentication rejected")
}

/// Parse a `<provider>__<organization>` checkpoint id back into its parts.
/// Organization names containing `__` are unambiguous because provider names
/// never do.
fn parse_checkpoint_id(id: &str) -> Option<(ProviderKind, String)> {
    let (provider_str, organization) = id.split_once("__")?;
    let provider = match provider_str {
        "github" => ProviderKind::GitHub,
        "gitlab" => ProviderKind::GitLab,
        "gitea" => ProviderKind::Gitea,
        "gogs" => ProviderKind::Gogs,
        _ => return None,
    };
    Some((provider, organization.to_string()))
}

/// Debounces persistence of one `(provider, organization)` checkpoint: at
/// most one save runs at a time, and any mutation that arrives while a save
/// is in flight is coalesced into the next one rather than queued.
struct CheckpointCoordinator {
    store: CheckpointStore,
    checkpoint: Mutex<Checkpoint>,
    save_lock: Mutex<()>,
    dirty: std::sync::atomic::AtomicBool,
}

impl CheckpointCoordinator {
    fn new(store: CheckpointStore, checkpoint: Checkpoint) -> Self {
        Self {
            store,
            checkpoint: Mutex::new(checkpoint),
            save_lock: Mutex::new(()),
            dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Persist the checkpoint as first seeded, before any jobs dispatch.
    fn flush_initial(&self) -> Result<()> {
        let snapshot = self.checkpoint.lock().expect("checkpoint mutex poisoned").clone();
        self.store.save(&snapshot)
    }

    fn mark_terminal(&self, job: &Job) {
        // A cancellation-induced skip leaves its repository in `pending` —
        // it was never actually reconciled, so a resumed run must retry it.
        if job.state == JobState::Skipped && job.last_error.as_deref() == Some("cancelled") {
            return;
        }
        {
            let mut checkpoint = self.checkpoint.lock().expect("checkpoint mutex poisoned");
            checkpoint.pending.retain(|n| n != &job.full_name());
            match job.state {
                JobState::Succeeded | JobState::Skipped => {
                    checkpoint.succeeded.push(job.full_name());
                }
                JobState::Failed => {
                    checkpoint.failed.push(sync_types::FailedRepository {
                        full_name: job.full_name(),
                        error: job.last_error.clone().unwrap_or_default(),
                    });
                }
                JobState::Pending | JobState::Running | JobState::Retrying => {}
            }
            checkpoint.updated_at = Utc::now();
        }
        self.save_debounced();
    }

    fn save_debounced(&self) {
        self.dirty.store(true, std::sync::atomic::Ordering::Release);
        let Ok(_guard) = self.save_lock.try_lock() else {
            return;
        };
        while self.dirty.swap(false, std::sync::atomic::Ordering::AcqRel) {
            let snapshot = self.checkpoint.lock().expect("checkpoint mutex poisoned").clone();
            // Best-effort: a failed debounced save is not fatal to the run,
            // the final flush below will try again.
            let _ = self.store.save(&snapshot);
        }
    }

    /// Unconditional final write once the run has finished dispatching.
    fn flush_final(&self) -> Result<()> {
        let snapshot = self.checkpoint.lock().expect("checkpoint mutex poisoned").clone();
        self.store.save(&snapshot)
    }

    /// If nothing is left pending and nothing failed, delete the checkpoint
    /// and return `Ok(None)`. A checkpoint with leftover failures is kept on
    /// disk for resume even though `pending` alone may already be empty —
    /// `Checkpoint::is_complete` only tracks the narrower "nothing left
    /// in-flight" notion, not "nothing left to retry".
    fn retain_if_incomplete(&self) -> Result<Option<String>> {
        let checkpoint = self.checkpoint.lock().expect("checkpoint mutex poisoned").clone();
        if checkpoint.is_complete() && checkpoint.failed.is_empty() {
            self.store.delete(checkpoint.provider, &checkpoint.organization)?;
            Ok(None)
        } else {
            Ok(Some(Checkpoint::file_stem(checkpoint.provider, &checkpoint.organization)))
        }
    }
}

struct CheckpointObserver<'a> {
    progress: &'a ProgressTracker,
    reporter: Mutex<&'a mut dyn Reporter>,
    job_org: &'a HashMap<String, usize>,
    coordinators: &'a HashMap<usize, CheckpointCoordinator>,
}

impl SchedulerObserver for CheckpointObserver<'_> {
    fn on_started(&self, job: &Job) {
        self.progress.update_job(&job.full_name(), JobState::Running, None, None);
    }

    fn on_retry(&self, job: &Job) {
        self.progress.update_job(
            &job.full_name(),
            JobState::Retrying,
            job.last_error.clone(),
            None,
        );
        if let Ok(mut reporter) = self.reporter.lock() {
            reporter.warn(&format!(
                "retrying {} (attempt {}): {}",
                job.full_name(),
                job.attempt,
                job.last_error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    fn on_terminal(&self, job: &Job) {
        match job.state {
            JobState::Succeeded => self.progress.complete_job(&job.full_name(), job.outcome.map(|o| format!("{o:?}"))),
            JobState::Failed => {
                self.progress.fail_job(&job.full_name(), job.last_error.as_deref().unwrap_or("unknown error"));
                if let Ok(mut reporter) = self.reporter.lock() {
                    reporter.error(&format!(
                        "{} failed: {}",
                        job.full_name(),
                        job.last_error.as_deref().unwrap_or("unknown error")
                    ));
                }
            }
            JobState::Skipped => {
                self.progress
                    .skip_job(&job.full_name(), job.last_error.as_deref().unwrap_or("skipped"));
            }
            JobState::Pending | JobState::Running | JobState::Retrying => {}
        }

        if let Some(idx) = self.job_org.get(&job.full_name()) {
            if let Some(coordinator) = self.coordinators.get(idx) {
                coordinator.mark_terminal(job);
            }
        }
    }
}
