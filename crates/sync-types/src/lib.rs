//! Core domain types for the bulk repository synchronization engine.
//!
//! This crate provides the data model shared by every other crate in the
//! workspace: repository descriptors, platform configuration, filters, job
//! and checkpoint state, progress snapshots, and the error taxonomy the
//! scheduler and strategy executor branch on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod duration_serde {
    //! Serialize a [`Duration`] as milliseconds (u64); deserialize from either
    //! a human-readable string (`"2s"`) or a plain integer (milliseconds).
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DurationHelper {
            String(String),
            Millis(u64),
        }

        match DurationHelper::deserialize(deserializer)? {
            DurationHelper::String(s) => humantime::parse_duration(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
            DurationHelper::Millis(ms) => Ok(Duration::from_millis(ms)),
        }
    }
}

/// Which hosting platform a [`PlatformConfig`] or [`Repository`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Gitea,
    Gogs,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Gitea => "gitea",
            ProviderKind::Gogs => "gogs",
        };
        f.write_str(s)
    }
}

/// Repository visibility as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Internal,
}

/// A description of one remote repository, produced by a provider client
/// listing and immutable for the lifetime of the run that discovered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub provider: ProviderKind,
    pub owner: String,
    pub name: String,
    pub https_clone_url: String,
    pub ssh_clone_url: String,
    pub default_branch: String,
    pub visibility: Visibility,
    pub archived: bool,
    pub fork: bool,
    pub language: Option<String>,
    pub size_kb: u64,
    pub stars: u64,
    pub topics: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// `owner/name`, the identity used for deduplication and pattern matching.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// How credentials should be embedded in a clone URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `https://<token>@host/owner/name.git`
    HttpsToken,
    /// `git@host:owner/name.git`
    Ssh,
}

/// Input describing one organization/group to traverse on one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub provider: ProviderKind,
    /// Base URL for self-hosted instances; `None` means the provider's public SaaS endpoint.
    pub base_url: Option<String>,
    pub token: String,
    pub organizations: Vec<String>,
    pub recursive: bool,
    pub skip_archived: bool,
    pub skip_forked: bool,
}

/// A pure-function predicate set applied by the filter pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub min_stars: u64,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visibility: Vec<Visibility>,
}

/// How the engine reconciles an existing local working tree with its remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Clone,
    #[default]
    Reset,
    Pull,
    Fetch,
    Rebase,
    Skip,
}

/// Result of running a [`Strategy`] against one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Cloned,
    Updated,
    Unchanged,
    Skipped,
}

/// `pending -> running -> (succeeded | failed | skipped)`, with a permitted
/// `running -> retrying -> running` loop bounded by the job's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

/// One unit of scheduled work: bring one repository's local working tree to
/// the desired state using the chosen strategy.
#[derive(Debug, Clone)]
pub struct Job {
    pub repository: Repository,
    pub strategy: Strategy,
    pub target_dir: PathBuf,
    pub attempt: u32,
    pub state: JobState,
    pub outcome: Option<Outcome>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(repository: Repository, strategy: Strategy, target_dir: PathBuf) -> Self {
        Self {
            repository,
            strategy,
            target_dir,
            attempt: 0,
            state: JobState::Pending,
            outcome: None,
            last_error: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn full_name(&self) -> String {
        self.repository.full_name()
    }
}

/// The error-taxonomy kinds from the engine's error handling design. Each
/// variant carries enough context to render a message while still letting
/// the scheduler and strategy executor match on kind to decide retryability.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("authentication rejected for provider {provider} ({organization}): {message}")]
    Authentication {
        provider: ProviderKind,
        organization: String,
        message: String,
    },

    #[error("{resource} not visible or not found: {message}")]
    AuthorizationNotFound { resource: String, message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("target directory is not a clone of the expected repository: {path}")]
    ConflictingDirectory { path: String },

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("rebase conflict: {0}")]
    RebaseConflict(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error kind should be retried under the job's retry
    /// budget. `RateLimited` is handled internally by provider clients and
    /// is never seen here in retryable form; by the time it reaches a job it
    /// has already converted to `Transient`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Whether this error kind is fatal for the whole run rather than scoped
    /// to a single job/organization/platform-config.
    pub fn is_request_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

/// A persisted snapshot of one run, sufficient to resume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub provider: ProviderKind,
    pub organization: String,
    pub target_path: PathBuf,
    pub strategy: Strategy,
    pub concurrency: usize,
    pub retry_budget: u32,
    pub pending: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedRepository>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

impl Checkpoint {
    pub fn new(
        provider: ProviderKind,
        organization: String,
        target_path: PathBuf,
        strategy: Strategy,
        concurrency: usize,
        retry_budget: u32,
        pending: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            provider,
            organization,
            target_path,
            strategy,
            concurrency,
            retry_budget,
            pending,
            succeeded: Vec::new(),
            failed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `true` once every discovered repository has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn file_stem(provider: ProviderKind, organization: &str) -> String {
        format!("{provider}__{organization}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRepository {
    pub full_name: String,
    pub error: String,
}

/// A monotonic, read-only view of aggregate progress. `succeeded` and
/// `failed` never go backwards within one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub discovered: u64,
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub per_repository: BTreeMap<String, RepositoryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub state: JobState,
    pub message: Option<String>,
    pub percent: Option<f32>,
}

/// The value returned when a `BulkClone` run terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResult {
    pub discovered: u64,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedRepository>,
    pub skipped: Vec<String>,
    pub cancelled: bool,
    pub duration: Option<Duration>,
    /// Present when the run ended with `pending` or `failed` repositories
    /// remaining, i.e. a checkpoint was retained for resume.
    pub checkpoint_id: Option<String>,
    /// Organization- and platform-level errors that did not abort the whole
    /// run (failed discovery for one org, bad credentials for one platform
    /// config).
    pub partial_errors: Vec<String>,
}

/// A cooperative cancellation signal shared across provider clients, the
/// scheduler, and strategy execution. Checked between page fetches, between
/// queued jobs, and during rate-limit/backoff sleeps so a caller-triggered
/// cancellation surfaces promptly rather than after the next long operation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Sleep in small slices, returning early if cancelled mid-sleep.
    pub fn sleep_interruptible(&self, total: Duration) {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.is_cancelled() {
            let slice = remaining.min(SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}
