//! Strategy execution: reconciling one local working tree with one remote
//! repository via `git`.
//!
//! Every invocation goes through [`run_git`], which enforces a per-operation
//! timeout and never lets a credential-bearing URL leak into a returned
//! error. `SYNC_GIT_BIN` overrides the `git` binary used, mirroring the way
//! tests substitute a fake binary without touching `PATH`.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use sync_retry::RetryStrategyConfig;
use sync_types::{AuthMode, CancellationToken, EngineError, Outcome, ProviderKind, Repository, Strategy};

/// Default per-Git-invocation timeout, per the reconciliation contract.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Executes one [`Strategy`] against one [`Repository`] at one target
/// directory.
pub struct GitExecutor {
    timeout: Duration,
    retry: RetryStrategyConfig,
}

impl Default for GitExecutor {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GIT_TIMEOUT,
            retry: RetryStrategyConfig::job_default(),
        }
    }
}

impl GitExecutor {
    pub fn new(timeout: Duration, retry: RetryStrategyConfig) -> Self {
        Self { timeout, retry }
    }

    /// Reconcile `target_dir` against `repo` under `strategy`, authenticating
    /// clone/fetch URLs with `auth_url` (already rendered by a provider
    /// client's `clone_url`). Retries transient failures up to the
    /// configured job budget; conflicts, auth failures and disk-full are
    /// returned immediately without retrying.
    pub fn execute(
        &self,
        ctx: &CancellationToken,
        target_dir: &Path,
        auth_url: &str,
        default_branch: &str,
        strategy: Strategy,
        provider: ProviderKind,
    ) -> Result<Outcome, EngineError> {
        if !target_dir.exists() {
            if strategy == Strategy::Skip {
                return Ok(Outcome::Skipped);
            }
            return self.run_with_retry(ctx, |attempt| {
                self.clone_repo(target_dir, auth_url, provider, attempt)
            });
        }

        if !is_git_repo(target_dir) {
            return Err(EngineError::ConflictingDirectory {
                path: target_dir.display().to_string(),
            });
        }

        let existing_origin = origin_url(target_dir, self.timeout)
            .map_err(|e| EngineError::Internal(scrub(&e.to_string())))?;
        match existing_origin {
            Some(url) if remotes_match(&url, auth_url) => {}
            _ => {
                return Err(EngineError::ConflictingDirectory {
                    path: target_dir.display().to_string(),
                });
            }
        }

        match strategy {
            Strategy::Clone => Ok(Outcome::Unchanged),
            Strategy::Skip => Ok(Outcome::Skipped),
            Strategy::Fetch => self.run_with_retry(ctx, |attempt| {
                self.fetch(target_dir, provider, attempt)
            }),
            Strategy::Pull => self.run_with_retry(ctx, |attempt| {
                self.pull(target_dir, default_branch, provider, attempt)
            }),
            Strategy::Reset => self.run_with_retry(ctx, |attempt| {
                self.reset_hard(target_dir, default_branch, provider, attempt)
            }),
            Strategy::Rebase => self.run_with_retry(ctx, |attempt| {
                self.rebase(target_dir, default_branch, provider, attempt)
            }),
        }
    }

    fn run_with_retry<F>(&self, ctx: &CancellationToken, mut op: F) -> Result<Outcome, EngineError>
    where
        F: FnMut(u32) -> Result<Outcome, EngineError>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match op(attempt) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    ctx.sleep_interruptible(sync_retry::calculate_delay(&self.retry, attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn clone_repo(
        &self,
        target_dir: &Path,
        auth_url: &str,
        provider: ProviderKind,
        _attempt: u32,
    ) -> Result<Outcome, EngineError> {
        if let Some(parent) = target_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Internal(format!("failed to create parent directory: {e}")))?;
        }
        let dest = target_dir.to_string_lossy().to_string();
        let out = run_git(&["clone", auth_url, &dest], Path::new("."), self.timeout)
            .map_err(git_invocation_error)?;
        if out.success {
            Ok(Outcome::Cloned)
        } else {
            Err(classify_failure(&out.stderr, provider))
        }
    }

    fn fetch(&self, target_dir: &Path, provider: ProviderKind, _attempt: u32) -> Result<Outcome, EngineError> {
        let before = head_ref(target_dir, self.timeout).ok().flatten();
        let out = run_git(&["fetch", "origin"], target_dir, self.timeout).map_err(git_invocation_error)?;
        if !out.success {
            return Err(classify_failure(&out.stderr, provider));
        }
        let after = remote_head(target_dir, self.timeout).ok().flatten();
        if before != after {
            Ok(Outcome::Updated)
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    fn pull(
        &self,
        target_dir: &Path,
        default_branch: &str,
        provider: ProviderKind,
        _attempt: u32,
    ) -> Result<Outcome, EngineError> {
        let before = head_ref(target_dir, self.timeout).ok().flatten();

        let fetch_out = run_git(&["fetch", "origin"], target_dir, self.timeout).map_err(git_invocation_error)?;
        if !fetch_out.success {
            return Err(classify_failure(&fetch_out.stderr, provider));
        }

        let remote_ref = format!("origin/{default_branch}");
        let ff_out = run_git(
            &["merge", "--ff-only", &remote_ref],
            target_dir,
            self.timeout,
        )
        .map_err(git_invocation_error)?;

        if ff_out.success {
            let after = head_ref(target_dir, self.timeout).ok().flatten();
            return Ok(if before != after { Outcome::Updated } else { Outcome::Unchanged });
        }

        let merge_out = run_git(&["merge", &remote_ref], target_dir, self.timeout).map_err(git_invocation_error)?;
        if merge_out.success {
            let after = head_ref(target_dir, self.timeout).ok().flatten();
            return Ok(if before != after { Outcome::Updated } else { Outcome::Unchanged });
        }

        let _ = run_git(&["merge", "--abort"], target_dir, self.timeout);
        Err(EngineError::MergeConflict(scrub(&merge_out.stderr)))
    }

    fn reset_hard(
        &self,
        target_dir: &Path,
        default_branch: &str,
        provider: ProviderKind,
        _attempt: u32,
    ) -> Result<Outcome, EngineError> {
        let before = head_ref(target_dir, self.timeout).ok().flatten();
        let was_clean = is_clean(target_dir, self.timeout).unwrap_or(false);

        let fetch_out = run_git(&["fetch", "origin"], target_dir, self.timeout).map_err(git_invocation_error)?;
        if !fetch_out.success {
            return Err(classify_failure(&fetch_out.stderr, provider));
        }

        let remote_ref = format!("origin/{default_branch}");
        let reset_out = run_git(&["reset", "--hard", &remote_ref], target_dir, self.timeout)
            .map_err(git_invocation_error)?;
        if !reset_out.success {
            return Err(classify_failure(&reset_out.stderr, provider));
        }

        let after = head_ref(target_dir, self.timeout).ok().flatten();
        Ok(if before != after || !was_clean {
            Outcome::Updated
        } else {
            Outcome::Unchanged
        })
    }

    fn rebase(
        &self,
        target_dir: &Path,
        default_branch: &str,
        provider: ProviderKind,
        _attempt: u32,
    ) -> Result<Outcome, EngineError> {
        let before = head_ref(target_dir, self.timeout).ok().flatten();

        let fetch_out = run_git(&["fetch", "origin"], target_dir, self.timeout).map_err(git_invocation_error)?;
        if !fetch_out.success {
            return Err(classify_failure(&fetch_out.stderr, provider));
        }

        let remote_ref = format!("origin/{default_branch}");
        let rebase_out = run_git(&["rebase", &remote_ref], target_dir, self.timeout).map_err(git_invocation_error)?;
        if rebase_out.success {
            let after = head_ref(target_dir, self.timeout).ok().flatten();
            return Ok(if before != after { Outcome::Updated } else { Outcome::Unchanged });
        }

        let _ = run_git(&["rebase", "--abort"], target_dir, self.timeout);
        Err(EngineError::RebaseConflict(scrub(&rebase_out.stderr)))
    }
}

/// Render the clone URL a [`GitExecutor`] should authenticate with, given a
/// provider-rendered HTTPS/SSH pair and the caller's requested auth mode.
/// Provider clients already do this via `ProviderClient::clone_url`; this
/// helper exists for callers (the orchestrator) that only have the raw
/// `Repository` and an `AuthMode`.
pub fn select_clone_url(repo: &Repository, auth_mode: AuthMode, https_with_token: &str) -> String {
    match auth_mode {
        AuthMode::HttpsToken => https_with_token.to_string(),
        AuthMode::Ssh => repo.ssh_clone_url.clone(),
    }
}

static GIT_BIN_OVERRIDE: std::sync::RwLock<Option<String>> = std::sync::RwLock::new(None);

fn git_program() -> String {
    if let Some(bin) = GIT_BIN_OVERRIDE
        .read()
        .expect("git binary override lock poisoned")
        .clone()
    {
        return bin;
    }
    env::var("SYNC_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

fn run_git(args: &[&str], cwd: &Path, timeout: Duration) -> Result<GitOutput> {
    let mut command = Command::new(git_program());
    command
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn git {args:?}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll git {args:?}"))?
        {
            Some(status) => {
                return Ok(GitOutput {
                    success: status.success(),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!(
                        "git {args:?} timed out after {}",
                        humantime::format_duration(timeout)
                    );
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn git_invocation_error(e: anyhow::Error) -> EngineError {
    let msg = scrub(&e.to_string());
    if msg.contains("timed out") {
        EngineError::Transient(msg)
    } else {
        EngineError::Internal(msg)
    }
}

fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

fn origin_url(path: &Path, timeout: Duration) -> Result<Option<String>> {
    let out = run_git(&["remote", "get-url", "origin"], path, timeout)?;
    if out.success {
        Ok(Some(out.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

fn head_ref(path: &Path, timeout: Duration) -> Result<Option<String>> {
    let out = run_git(&["rev-parse", "HEAD"], path, timeout)?;
    Ok(out.success.then(|| out.stdout.trim().to_string()))
}

fn remote_head(path: &Path, timeout: Duration) -> Result<Option<String>> {
    let out = run_git(&["rev-parse", "FETCH_HEAD"], path, timeout)?;
    Ok(out.success.then(|| out.stdout.trim().to_string()))
}

fn is_clean(path: &Path, timeout: Duration) -> Result<bool> {
    let out = run_git(&["status", "--porcelain"], path, timeout)?;
    Ok(out.success && out.stdout.trim().is_empty())
}

/// Strip credentials from a `scheme://token@host/...` URL before it is
/// allowed into a log line or error message.
pub fn scrub(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(scheme_idx) = rest.find("://") {
        let (prefix, after_scheme) = rest.split_at(scheme_idx + 3);
        out.push_str(prefix);
        match after_scheme.find('@') {
            Some(at_idx) if !after_scheme[..at_idx].contains(['/', ' ', '\n']) => {
                out.push_str("***@");
                rest = &after_scheme[at_idx + 1..];
            }
            _ => {
                out.push_str(&after_scheme[..0]);
                rest = after_scheme;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Compare an existing `origin` remote to the authenticated clone URL the
/// engine would use, ignoring scheme, embedded credentials and a trailing
/// `.git`.
fn remotes_match(existing: &str, expected: &str) -> bool {
    normalize_remote(existing) == normalize_remote(expected)
}

fn normalize_remote(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let without_creds = without_scheme
        .split_once('@')
        .map(|(_, rest)| rest)
        .unwrap_or(without_scheme);
    // SSH `git@host:owner/name.git` form: normalize the `:` separator to `/`.
    let normalized_sep = without_creds.replacen(':', "/", 1);
    normalized_sep
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_lowercase()
}

fn classify_failure(stderr: &str, provider: ProviderKind) -> EngineError {
    let scrubbed = scrub(stderr);
    let lower = scrubbed.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection reset")
        || lower.contains("connection timed out")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("the remote end hung up unexpectedly")
        || lower.contains("early eof")
        || lower.contains("operation timed out")
    {
        EngineError::Transient(scrubbed)
    } else if lower.contains("authentication failed")
        || lower.contains("invalid username or password")
        || lower.contains("permission denied (publickey")
    {
        EngineError::Authentication {
            provider,
            organization: String::new(),
            message: scrubbed,
        }
    } else if lower.contains("no space left on device") || lower.contains("disk quota exceeded") {
        EngineError::DiskFull(scrubbed)
    } else if lower.contains("permission denied") {
        EngineError::PermissionDenied(scrubbed)
    } else {
        EngineError::Internal(scrubbed)
    }
}
