//! Thin CLI entry point wiring a TOML config file and a handful of flags
//! into `sync_core::Orchestrator::bulk_clone`.
//!
//! Flag parsing, help text, and subcommands are intentionally minimal here:
//! this binary is a caller of the engine, not the engine itself. It owns
//! exactly what the engine refuses to own — reading a config file, resolving
//! tokens from the environment, and rendering progress to a terminal.

mod progress;

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use sync_core::{BulkCloneRequest, DirectoryLayout, Orchestrator};
use sync_progress::{ProgressTracker, Reporter};
use sync_state::CheckpointStore;
use sync_types::{AuthMode, CancellationToken, Filter, PlatformConfig, ProviderKind, Strategy};

#[derive(Parser, Debug)]
#[command(name = "sync-cli", version)]
#[command(about = "Bulk clone/sync Git repositories across GitHub, GitLab, Gitea, and Gogs")]
struct Cli {
    /// Path to a TOML config file describing platforms and defaults.
    #[arg(long)]
    config: PathBuf,

    /// Directory holding checkpoint state (default: the engine's own default).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the config file's output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the config file's concurrency (1-50).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override the config file's reconciliation strategy.
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Override the config file's per-job retry budget.
    #[arg(long)]
    retry_budget: Option<u32>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover and reconcile repositories (the default operation).
    Sync,
    /// Resume a previously interrupted run from its checkpoint.
    Resume { checkpoint_id: String },
    /// List outstanding checkpoints.
    ListCheckpoints,
    /// Delete a checkpoint without resuming it.
    DeleteCheckpoint { checkpoint_id: String },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Clone,
    Reset,
    Pull,
    Fetch,
    Rebase,
    Skip,
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Clone => Strategy::Clone,
            StrategyArg::Reset => Strategy::Reset,
            StrategyArg::Pull => Strategy::Pull,
            StrategyArg::Fetch => Strategy::Fetch,
            StrategyArg::Rebase => Strategy::Rebase,
            StrategyArg::Skip => Strategy::Skip,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    platforms: Vec<PlatformConfigFile>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    retry_budget: Option<u32>,
    #[serde(default)]
    include_private: Option<bool>,
    #[serde(default)]
    flat_layout: Option<bool>,
    #[serde(default)]
    filter: Option<FilterFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterFile {
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default)]
    min_stars: u64,
    #[serde(default)]
    max_size_mb: Option<u64>,
    #[serde(default)]
    languages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformConfigFile {
    provider: String,
    #[serde(default)]
    base_url: Option<String>,
    /// Name of the environment variable holding this platform's token.
    /// The engine never reads environment variables itself — only the CLI
    /// does, to resolve this into a plain `PlatformConfig.token`.
    #[serde(default)]
    token_env: Option<String>,
    organizations: Vec<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    skip_archived: bool,
    #[serde(default)]
    skip_forked: bool,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let checkpoint_store = match &cli.state_dir {
        Some(dir) => CheckpointStore::new(dir.clone()),
        None => CheckpointStore::new(CheckpointStore::default_base_dir()),
    };
    let orchestrator = Orchestrator::new(checkpoint_store);

    match &cli.cmd {
        Commands::ListCheckpoints => {
            for checkpoint in orchestrator.list_checkpoints()? {
                println!(
                    "{}: {} pending, {} succeeded, {} failed (updated {})",
                    sync_types::Checkpoint::file_stem(checkpoint.provider, &checkpoint.organization),
                    checkpoint.pending.len(),
                    checkpoint.succeeded.len(),
                    checkpoint.failed.len(),
                    checkpoint.updated_at,
                );
            }
            Ok(())
        }
        Commands::DeleteCheckpoint { checkpoint_id } => {
            orchestrator.delete_checkpoint(checkpoint_id)?;
            println!("deleted {checkpoint_id}");
            Ok(())
        }
        Commands::Sync => run_bulk_clone(&orchestrator, &cli, &config, None),
        Commands::Resume { checkpoint_id } => {
            run_bulk_clone(&orchestrator, &cli, &config, Some(checkpoint_id.clone()))
        }
    }
}

fn run_bulk_clone(
    orchestrator: &Orchestrator,
    cli: &Cli,
    config: &ConfigFile,
    resume_checkpoint_id: Option<String>,
) -> Result<()> {
    let request = build_request(cli, config, resume_checkpoint_id)?;
    let ctx = CancellationToken::new();
    install_ctrlc_handler(&ctx);

    let progress = ProgressTracker::new(0);
    let renderer = progress::ProgressRenderer::new(0);
    let mut reporter = CliReporter;

    let result = std::thread::scope(|scope| -> Result<sync_types::BulkResult> {
        let poll_ctx = ctx.clone();
        let poll_progress: &ProgressTracker = &progress;
        let poll_renderer = &renderer;
        scope.spawn(move || {
            while !poll_ctx.is_cancelled() {
                poll_renderer.render(&poll_progress.snapshot());
                std::thread::sleep(Duration::from_millis(200));
            }
        });

        let start = Instant::now();
        let outcome = orchestrator.bulk_clone(&ctx, &request, &progress, &mut reporter);
        ctx.cancel();
        renderer.finish(&progress.snapshot(), start.elapsed());
        outcome
    })?;

    print_result(&result);
    if !result.failed.is_empty() || result.checkpoint_id.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn install_ctrlc_handler(ctx: &CancellationToken) {
    // Minimal dependency-free signal handling: spawn nothing here and rely
    // on the caller's own process supervision for SIGTERM/SIGINT. A richer
    // CLI would wire `ctrlc` in; deliberately out of scope for the engine's
    // CLI adapter.
    let _ = ctx;
}

fn print_result(result: &sync_types::BulkResult) {
    println!();
    println!("discovered: {}", result.discovered);
    println!("succeeded:  {}", result.succeeded.len());
    println!("failed:     {}", result.failed.len());
    println!("skipped:    {}", result.skipped.len());
    println!("cancelled:  {}", result.cancelled);

    for failure in &result.failed {
        println!("  FAILED {}: {}", failure.full_name, failure.error);
    }
    for err in &result.partial_errors {
        println!("  WARN {err}");
    }
    if let Some(id) = &result.checkpoint_id {
        println!("checkpoint retained: {id} (resume with `sync-cli --config ... resume {id}`)");
    }
}

fn load_config(path: &PathBuf) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
}

fn build_request(
    cli: &Cli,
    config: &ConfigFile,
    resume_checkpoint_id: Option<String>,
) -> Result<BulkCloneRequest> {
    let platforms = config
        .platforms
        .iter()
        .map(resolve_platform)
        .collect::<Result<Vec<_>>>()?;
    if platforms.is_empty() {
        bail!("config file must declare at least one [[platforms]] entry");
    }

    let strategy = cli
        .strategy
        .map(Strategy::from)
        .or_else(|| config.strategy.as_deref().and_then(parse_strategy))
        .unwrap_or_default();

    let filter = config
        .filter
        .as_ref()
        .map(|f| Filter {
            include_patterns: f.include_patterns.clone(),
            exclude_patterns: f.exclude_patterns.clone(),
            min_stars: f.min_stars,
            max_size_mb: f.max_size_mb,
            languages: f.languages.clone(),
            updated_after: None,
            visibility: Vec::new(),
        })
        .unwrap_or_default();

    Ok(BulkCloneRequest {
        platforms,
        output_dir: cli
            .output_dir
            .clone()
            .or_else(|| config.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        concurrency: cli.concurrency.or(config.concurrency).unwrap_or(5),
        strategy,
        filter,
        include_private: config.include_private.unwrap_or(true),
        retry_budget: cli.retry_budget.or(config.retry_budget).unwrap_or(3),
        auth_mode: AuthMode::HttpsToken,
        layout: if config.flat_layout.unwrap_or(false) {
            DirectoryLayout::Flat
        } else {
            DirectoryLayout::Hierarchical
        },
        git_timeout: sync_git::DEFAULT_GIT_TIMEOUT,
        resume_checkpoint_id,
    })
}

fn parse_strategy(s: &str) -> Option<Strategy> {
    match s {
        "clone" => Some(Strategy::Clone),
        "reset" => Some(Strategy::Reset),
        "pull" => Some(Strategy::Pull),
        "fetch" => Some(Strategy::Fetch),
        "rebase" => Some(Strategy::Rebase),
        "skip" => Some(Strategy::Skip),
        _ => None,
    }
}

fn resolve_platform(p: &PlatformConfigFile) -> Result<PlatformConfig> {
    resolve_platform_with(p, |var| std::env::var(var).ok())
}

/// Same as [`resolve_platform`] but with the environment lookup injected, so
/// tests can exercise token resolution without mutating process-global
/// environment state.
fn resolve_platform_with(
    p: &PlatformConfigFile,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PlatformConfig> {
    let provider = match p.provider.as_str() {
        "github" => ProviderKind::GitHub,
        "gitlab" => ProviderKind::GitLab,
        "gitea" => ProviderKind::Gitea,
        "gogs" => ProviderKind::Gogs,
        other => bail!("unknown provider {other:?} in config file"),
    };
    let token = p
        .token_env
        .as_deref()
        .and_then(&lookup)
        .unwrap_or_default();
    Ok(PlatformConfig {
        provider,
        base_url: p.base_url.clone(),
        token,
        organizations: p.organizations.clone(),
        recursive: p.recursive,
        skip_archived: p.skip_archived,
        skip_forked: p.skip_forked,
    })
}
