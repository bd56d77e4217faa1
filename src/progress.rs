//! Per-stage progress counters and log lines

use std::sync::atomic::{AtomicUsize, Ordering};

/// How one item of a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Skipped,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Completed => "ok",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

/// Snapshot of a stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StageCounts {
    pub fn done(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Shared counters for one stage (discovery, extraction, enrichment, ...).
/// Safe to tick from many tasks at once.
#[derive(Debug)]
pub struct StageProgress {
    stage: &'static str,
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl StageProgress {
    pub fn new(stage: &'static str, total: usize) -> Self {
        Self {
            stage,
            total: AtomicUsize::new(total),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one item and emit a progress line for it.
    pub fn tick(&self, outcome: Outcome, item: &str) -> StageCounts {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed => &self.failed,
            Outcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let counts = self.counts();
        tracing::info!(
            stage = self.stage,
            done = counts.done(),
            total = counts.total,
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            "{} {}",
            outcome.label(),
            truncate_str(item, 80)
        );
        counts
    }

    pub fn counts(&self) -> StageCounts {
        StageCounts {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// One-line coloured summary for the terminal.
    pub fn summary_line(&self) -> String {
        let c = self.counts();
        let failed = if c.failed > 0 {
            format!("\x1b[31m{} failed\x1b[0m", c.failed)
        } else {
            "0 failed".to_string()
        };
        format!(
            "{}: {}/{} done, {} ok, {}, {} skipped",
            self.stage,
            c.done(),
            c.total,
            c.completed,
            failed,
            c.skipped
        )
    }
}

/// Truncate string safely at char boundary
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
