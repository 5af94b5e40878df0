//! Progress bar rendering with TTY detection.
//!
//! Polls a [`sync_progress::ProgressTracker`] snapshot at a fixed interval
//! and renders it with `indicatif` when stdout is a terminal, or logs plain
//! lines otherwise. The tracker itself is oblivious to how (or whether) it's
//! displayed; this module is the one opinion about that.

use std::time::Duration;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Renders a [`ProgressTracker`] snapshot, either as a live bar or a plain
/// line, depending on whether stdout is a TTY.
pub struct ProgressRenderer {
    bar: Option<ProgressBar>,
}

impl ProgressRenderer {
    pub fn new(discovered: u64) -> Self {
        let bar = if is_tty() {
            let pb = ProgressBar::new(discovered);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };
        Self { bar }
    }

    /// Render one snapshot. Called repeatedly (e.g. every 200ms) from a
    /// poller thread while the orchestrator's `bulk_clone` call runs on the
    /// main thread.
    pub fn render(&self, snapshot: &sync_types::ProgressSnapshot) {
        let msg = format!(
            "synced {}/{} ({} failed, {} skipped)",
            snapshot.succeeded, snapshot.discovered, snapshot.failed, snapshot.skipped
        );
        match &self.bar {
            Some(pb) => {
                pb.set_length(snapshot.discovered.max(1));
                pb.set_position(snapshot.succeeded + snapshot.failed + snapshot.skipped);
                pb.set_message(msg);
            }
            None => eprintln!("{msg}"),
        }
    }

    pub fn finish(&self, snapshot: &sync_types::ProgressSnapshot, elapsed: Duration) {
        let msg = format!(
            "done: {} succeeded, {} failed, {} skipped in {:.1?}",
            snapshot.succeeded, snapshot.failed, snapshot.skipped, elapsed
        );
        match &self.bar {
            Some(pb) => {
                pb.set_message(msg);
                pb.finish();
            }
            None => eprintln!("{msg}"),
        }
    }
}
