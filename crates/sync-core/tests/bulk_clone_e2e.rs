//! Orchestrator-level end-to-end coverage: discovery, filtering,
//! checkpoint-seeding, scheduling and termination exercised together through
//! [`Orchestrator::bulk_clone`], against a mock Gitea server and a fake `git`
//! binary. Unit tests elsewhere in this crate cover the individual pieces;
//! these drive the full composition the way a real run would.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;
use tiny_http::{Header, Response, Server, StatusCode};

use sync_core::{BulkCloneRequest, DirectoryLayout, Orchestrator};
use sync_progress::{NullReporter, ProgressTracker};
use sync_state::CheckpointStore;
use sync_types::{AuthMode, CancellationToken, Filter, PlatformConfig, ProviderKind, Strategy};

/// Restores whatever a process environment variable held before the test
/// touched it. `SYNC_GIT_BIN` is process-global, so tests in this file that
/// use it are `#[serial]`.
struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn set(pairs: &[(&'static str, &str)]) -> Self {
        let saved = pairs
            .iter()
            .map(|(key, value)| {
                let previous = env::var(key).ok();
                unsafe { env::set_var(key, value) };
                (*key, previous)
            })
            .collect();
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in &self.saved {
            match previous {
                Some(value) => unsafe { env::set_var(key, value) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }
}

/// A fake `git` that handles exactly what a fresh-directory clone and a
/// pre-existing-directory origin check need: `clone`, and `remote get-url
/// origin`. `FAKE_GIT_SLEEP` stalls every clone, for cancellation tests.
/// `FAKE_GIT_FAIL_MATCH`/`FAKE_GIT_FAIL_MARKER` fail one clone by substring
/// match on the auth URL while the marker file exists.
fn write_fake_git(bin_dir: &Path) -> PathBuf {
    let script = r#"#!/usr/bin/env sh
case "$1" in
  clone)
    if [ -n "$FAKE_GIT_SLEEP" ]; then sleep "$FAKE_GIT_SLEEP"; fi
    if [ -n "$FAKE_GIT_FAIL_MATCH" ] && [ -f "$FAKE_GIT_FAIL_MARKER" ]; then
      case "$2" in
        *"$FAKE_GIT_FAIL_MATCH"*)
          echo "fatal: Authentication failed for '$2'" >&2
          exit 1
          ;;
      esac
    fi
    mkdir -p "$3/.git"
    exit 0
    ;;
  remote)
    if [ -f ".git/origin-url" ]; then
      cat ".git/origin-url"
      exit 0
    fi
    exit 1
    ;;
  *)
    exit 0
    ;;
esac
"#;
    let path = bin_dir.join("git");
    fs::write(&path, script).expect("write fake git");
    let mut perms = fs::metadata(&path).expect("stat fake git").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod fake git");
    path
}

/// Serves one canned `(status, headers, body)` response per request, in
/// order, then stops. Mirrors the single-request pattern `sync-providers`
/// already uses for its own mock-server tests, extended to a sequence.
fn spawn_canned_server(responses: Vec<(u16, Vec<(&'static str, String)>, String)>) -> (String, thread::JoinHandle<()>) {
    let server = Server::http("127.0.0.1:0").expect("bind mock server");
    let addr = format!("http://{}", server.server_addr());
    let handle = thread::spawn(move || {
        for (status, headers, body) in responses {
            let req = server
                .recv_timeout(Duration::from_secs(5))
                .expect("recv")
                .expect("request");
            let mut response = Response::from_string(body).with_status_code(StatusCode(status));
            for (name, value) in headers {
                response = response.with_header(Header::from_bytes(name, value).unwrap());
            }
            req.respond(response).expect("respond");
        }
    });
    (addr, handle)
}

fn repo_json(org: &str, name: &str, archived: bool) -> serde_json::Value {
    json!({
        "full_name": format!("{org}/{name}"),
        "name": name,
        "clone_url": format!("https://git.example.com/{org}/{name}.git"),
        "ssh_url": format!("git@git.example.com:{org}/{name}.git"),
        "default_branch": "main",
        "private": false,
        "archived": archived,
        "fork": false,
        "language": "Rust",
        "size": 10,
        "stars_count": 0,
        "topics": [],
        "updated_at": "2024-01-01T00:00:00Z",
    })
}

fn platform_config(base_url: String, skip_archived: bool) -> PlatformConfig {
    PlatformConfig {
        provider: ProviderKind::Gitea,
        base_url: Some(base_url),
        token: "test-token".into(),
        organizations: vec!["acme".into()],
        recursive: false,
        skip_archived,
        skip_forked: false,
    }
}

fn base_request(output_dir: PathBuf, platform: PlatformConfig, concurrency: usize) -> BulkCloneRequest {
    BulkCloneRequest {
        platforms: vec![platform],
        output_dir,
        concurrency,
        strategy: Strategy::Reset,
        filter: Filter::default(),
        include_private: true,
        retry_budget: 3,
        auth_mode: AuthMode::HttpsToken,
        layout: DirectoryLayout::Hierarchical,
        git_timeout: Duration::from_secs(5),
        resume_checkpoint_id: None,
    }
}

fn json_header() -> Vec<(&'static str, String)> {
    vec![("Content-Type", "application/json".to_string())]
}

#[test]
#[serial]
fn happy_path_clones_every_discovered_repository() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let _env = EnvGuard::set(&[("SYNC_GIT_BIN", fake_git.to_str().unwrap())]);

    let body = json!([
        repo_json("acme", "repo-01", false),
        repo_json("acme", "repo-02", false),
        repo_json("acme", "repo-03", false),
    ])
    .to_string();
    let (addr, handle) = spawn_canned_server(vec![(200, json_header(), body)]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let request = base_request(work.path().join("repos"), platform_config(addr, false), 2);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let result = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("bulk_clone");

    assert_eq!(result.discovered, 3);
    assert_eq!(result.succeeded.len(), 3);
    assert!(result.failed.is_empty());
    assert!(result.skipped.is_empty());
    assert!(!result.cancelled);
    assert!(result.checkpoint_id.is_none());
    assert!(!CheckpointStore::new(checkpoints.clone()).has_checkpoint(ProviderKind::Gitea, "acme"));

    handle.join().unwrap();
}

#[test]
#[serial]
fn archived_repository_is_filtered_before_scheduling() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let _env = EnvGuard::set(&[("SYNC_GIT_BIN", fake_git.to_str().unwrap())]);

    let body = json!([
        repo_json("acme", "repo-01", false),
        repo_json("acme", "repo-02", false),
        repo_json("acme", "repo-03", true),
        repo_json("acme", "repo-04", false),
        repo_json("acme", "repo-05", false),
    ])
    .to_string();
    let (addr, handle) = spawn_canned_server(vec![(200, json_header(), body)]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let request = base_request(work.path().join("repos"), platform_config(addr, true), 2);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let result = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("bulk_clone");

    assert_eq!(result.discovered, 4);
    assert_eq!(result.succeeded.len(), 4);
    assert!(!result.succeeded.contains(&"acme/repo-03".to_string()));
    assert!(result.failed.is_empty());

    handle.join().unwrap();
}

#[test]
#[serial]
fn partial_failure_persists_checkpoint_and_resume_retries_only_the_failure() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let marker = work.path().join("fail-active");
    fs::write(&marker, b"").unwrap();
    let _env = EnvGuard::set(&[
        ("SYNC_GIT_BIN", fake_git.to_str().unwrap()),
        ("FAKE_GIT_FAIL_MATCH", "repo-04"),
        ("FAKE_GIT_FAIL_MARKER", marker.to_str().unwrap()),
    ]);

    let mut repos = Vec::new();
    for i in 1..=10 {
        repos.push(repo_json("acme", &format!("repo-{i:02}"), false));
    }
    let list_body = json!(repos).to_string();
    let get_body = repo_json("acme", "repo-04", false).to_string();
    let (addr, handle) = spawn_canned_server(vec![
        (200, json_header(), list_body),
        (200, json_header(), get_body),
    ]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let platform = platform_config(addr, false);
    let request = base_request(work.path().join("repos"), platform.clone(), 3);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let first = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("first bulk_clone");

    assert_eq!(first.succeeded.len(), 9);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].full_name, "acme/repo-04");
    let checkpoint_id = first.checkpoint_id.clone().expect("checkpoint persisted");
    assert_eq!(checkpoint_id, "gitea__acme");

    let store = CheckpointStore::new(checkpoints.clone());
    let persisted = store
        .load(ProviderKind::Gitea, "acme")
        .unwrap()
        .expect("checkpoint on disk");
    assert!(persisted.pending.is_empty());
    assert_eq!(persisted.failed.len(), 1);

    fs::remove_file(&marker).unwrap();

    let mut resume_request = base_request(work.path().join("repos"), platform, 3);
    resume_request.resume_checkpoint_id = Some(checkpoint_id);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let second = orchestrator
        .bulk_clone(&ctx, &resume_request, &progress, &mut reporter)
        .expect("resumed bulk_clone");

    assert_eq!(second.succeeded, vec!["acme/repo-04".to_string()]);
    assert!(second.failed.is_empty());
    assert!(second.checkpoint_id.is_none());
    assert!(!store.has_checkpoint(ProviderKind::Gitea, "acme"));

    handle.join().unwrap();
}

#[test]
#[serial]
fn rate_limited_discovery_sleeps_then_completes_without_surfacing_an_error() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let _env = EnvGuard::set(&[("SYNC_GIT_BIN", fake_git.to_str().unwrap())]);

    let now = chrono::Utc::now().timestamp().to_string();
    let list_body = json!([
        repo_json("acme", "repo-01", false),
        repo_json("acme", "repo-02", false),
    ])
    .to_string();
    let (addr, handle) = spawn_canned_server(vec![
        (429, vec![("ratelimit-reset", now)], String::new()),
        (200, json_header(), list_body),
    ]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let request = base_request(work.path().join("repos"), platform_config(addr, false), 2);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let result = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("bulk_clone");

    assert_eq!(result.discovered, 2);
    assert_eq!(result.succeeded.len(), 2);
    assert!(result.partial_errors.is_empty());
    assert!(result.checkpoint_id.is_none());

    handle.join().unwrap();
}

#[test]
#[serial]
fn cancellation_mid_run_leaves_unreconciled_repositories_pending() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let _env = EnvGuard::set(&[
        ("SYNC_GIT_BIN", fake_git.to_str().unwrap()),
        ("FAKE_GIT_SLEEP", "0.4"),
    ]);

    let mut repos = Vec::new();
    for i in 1..=10 {
        repos.push(repo_json("acme", &format!("repo-{i:02}"), false));
    }
    let list_body = json!(repos).to_string();
    let (addr, handle) = spawn_canned_server(vec![(200, json_header(), list_body)]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let request = base_request(work.path().join("repos"), platform_config(addr, false), 2);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let canceller = ctx.clone();
    let cancel_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        canceller.cancel();
    });

    let result = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("bulk_clone");
    cancel_thread.join().unwrap();

    assert!(result.cancelled);
    assert!(result.succeeded.len() + result.failed.len() < 10);
    assert!(!result.skipped.is_empty());

    let store = CheckpointStore::new(checkpoints.clone());
    assert!(store.has_checkpoint(ProviderKind::Gitea, "acme"));
    let persisted = store
        .load(ProviderKind::Gitea, "acme")
        .unwrap()
        .expect("checkpoint on disk");
    assert!(!persisted.pending.is_empty());
    assert_eq!(
        persisted.pending.len() + persisted.succeeded.len() + persisted.failed.len(),
        10
    );

    handle.join().unwrap();
}

#[test]
#[serial]
fn conflicting_directory_fails_only_its_own_job() {
    let work = TempDir::new().unwrap();
    let bin = work.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let fake_git = write_fake_git(&bin);
    let _env = EnvGuard::set(&[("SYNC_GIT_BIN", fake_git.to_str().unwrap())]);

    let output_dir = work.path().join("repos");
    let conflicting_dir = output_dir.join("gitea").join("acme").join("repo-b");
    fs::create_dir_all(conflicting_dir.join(".git")).unwrap();
    fs::write(
        conflicting_dir.join(".git").join("origin-url"),
        "https://stale.example.com/acme/old-name.git\n",
    )
    .unwrap();

    let list_body = json!([
        repo_json("acme", "repo-a", false),
        repo_json("acme", "repo-b", false),
        repo_json("acme", "repo-c", false),
    ])
    .to_string();
    let (addr, handle) = spawn_canned_server(vec![(200, json_header(), list_body)]);

    let checkpoints = work.path().join("checkpoints");
    let orchestrator = Orchestrator::new(CheckpointStore::new(checkpoints.clone()));
    let request = base_request(output_dir, platform_config(addr, false), 2);
    let progress = ProgressTracker::new(0);
    let mut reporter = NullReporter;
    let ctx = CancellationToken::new();

    let result = orchestrator
        .bulk_clone(&ctx, &request, &progress, &mut reporter)
        .expect("bulk_clone");

    assert_eq!(result.discovered, 3);
    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].full_name, "acme/repo-b");
    assert!(result.failed[0].error.contains("not a clone of the expected repository"));
    assert!(result.checkpoint_id.is_some());

    handle.join().unwrap();
}
