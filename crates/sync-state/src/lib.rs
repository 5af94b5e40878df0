//! Checkpoint persistence for the bulk sync engine.
//!
//! Checkpoints are the engine's only durable state: one file per
//! `(provider, organization)` pair, written atomically so that a crash or
//! power loss can never leave a checkpoint half-written. Readers that see a
//! schema version newer than they understand refuse to load rather than
//! silently misinterpreting the file.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sync_types::{Checkpoint, ProviderKind, CHECKPOINT_SCHEMA_VERSION};

const CHECKPOINT_EXTENSION: &str = "state";

/// Directory-backed checkpoint store.
///
/// Every operation is scoped to a single base directory, created lazily on
/// first write. The store does not cache anything in memory: every call
/// round-trips through the filesystem so that concurrent processes (or a
/// resumed run started from a different invocation) always see the latest
/// persisted state.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Default location: `<user-state-dir>/bulk-clone-engine/`. Falls back to
    /// `./.bulk-clone-engine` if the platform state directory cannot be
    /// determined (e.g. `HOME` unset).
    pub fn default_base_dir() -> PathBuf {
        dirs_base_state_dir()
            .map(|d| d.join("bulk-clone-engine"))
            .unwrap_or_else(|| PathBuf::from(".bulk-clone-engine"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn checkpoint_path(&self, provider: ProviderKind, organization: &str) -> PathBuf {
        self.base_dir
            .join(Checkpoint::file_stem(provider, organization))
            .with_extension(CHECKPOINT_EXTENSION)
    }

    /// Persist `checkpoint`, overwriting any prior checkpoint for the same
    /// `(provider, organization)`. Atomic: a reader never observes a partial
    /// write.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "failed to create checkpoint directory {}",
                self.base_dir.display()
            )
        })?;

        let path = self.checkpoint_path(checkpoint.provider, &checkpoint.organization);
        atomic_write_json(&path, checkpoint)
    }

    /// Load the checkpoint for `(provider, organization)`, if one exists.
    ///
    /// Returns `Ok(None)` when no checkpoint file is present. Returns an
    /// error if the file exists but carries a schema version this build does
    /// not understand, or is otherwise corrupt.
    pub fn load(&self, provider: ProviderKind, organization: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(provider, organization);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse checkpoint JSON {}", path.display()))?;
        validate_schema_version(&path, &raw)?;

        let checkpoint: Checkpoint = serde_json::from_value(raw)
            .with_context(|| format!("failed to deserialize checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// `true` if a checkpoint file exists for `(provider, organization)`,
    /// without parsing or validating it.
    pub fn has_checkpoint(&self, provider: ProviderKind, organization: &str) -> bool {
        self.checkpoint_path(provider, organization).exists()
    }

    /// Remove the checkpoint for `(provider, organization)`. A no-op, not an
    /// error, if none exists.
    pub fn delete(&self, provider: ProviderKind, organization: &str) -> Result<()> {
        let path = self.checkpoint_path(provider, organization);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove checkpoint {}", path.display()))?;
        }
        Ok(())
    }

    /// List every checkpoint found directly under the base directory.
    ///
    /// Entries that fail to parse or carry an unsupported schema version are
    /// skipped rather than aborting the whole listing, since one corrupt
    /// checkpoint should not hide the others.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .with_context(|| format!("failed to read directory {}", self.base_dir.display()))?;

        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read directory entry in {}", self.base_dir.display())
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }

            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Ok(raw) = serde_json::from_str::<serde_json::Value>(&content) else {
                continue;
            };
            if validate_schema_version(&path, &raw).is_err() {
                continue;
            }
            if let Ok(checkpoint) = serde_json::from_value::<Checkpoint>(raw) {
                out.push(checkpoint);
            }
        }

        Ok(out)
    }
}

/// Refuse to load a checkpoint from a schema version newer than this build
/// understands. There is no migration path for checkpoints: any mismatch is
/// a hard error rather than a best-effort upgrade.
fn validate_schema_version(path: &Path, raw: &serde_json::Value) -> Result<()> {
    let version = raw
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .with_context(|| format!("checkpoint {} is missing schema_version", path.display()))?;

    if version as u32 > CHECKPOINT_SCHEMA_VERSION {
        bail!(
            "checkpoint {} has schema_version {} but this build only understands up to {}; refusing to load",
            path.display(),
            version,
            CHECKPOINT_SCHEMA_VERSION,
        );
    }

    Ok(())
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize checkpoint JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are silently ignored
/// because not all platforms support opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

fn dirs_base_state_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("state"))
}
