//! Multi-file download progress aggregation.
//!
//! Download callbacks arrive in two shapes: a bare fraction with no file
//! attribution, or a structured record carrying file/percent/bytes. Both are
//! normalized into [`ProgressUpdate`] at the boundary so the tracker itself
//! never type-sniffs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// File identifier used when a callback carries no file attribution.
pub const UNATTRIBUTED_FILE: &str = "model";

/// How a completed file weighs into the overall percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionWeighting {
    /// Completed files stay in the map pinned at 100; overall is a simple
    /// mean over everything ever seen.
    #[default]
    Retained,
    /// Completed files leave the in-progress map and count 100 toward a
    /// fixed denominator of all files ever seen.
    Counted,
}

/// Raw callback payload before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressSignal {
    /// Bare fraction in `[0, 1]`, no file attribution.
    Fraction(f64),
    /// Structured record from a per-file download callback.
    Record {
        status: RecordStatus,
        file: Option<String>,
        /// Percent in `[0, 100]`.
        percent: Option<f64>,
        /// Bytes downloaded so far, if known.
        loaded_bytes: Option<u64>,
    },
}

/// Status carried by the structured callback shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Started,
    Progress,
    Done,
}

/// A normalized progress update, the only shape the tracker accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A file download has started.
    Started { file: String },
    /// Incremental progress for one file, percent in `[0, 100]`.
    Advanced {
        file: String,
        percent: f64,
        loaded_bytes: Option<u64>,
    },
    /// One file finished downloading.
    Finished { file: String },
}

impl ProgressSignal {
    /// Collapse both callback shapes into one tagged update.
    pub fn normalize(self) -> ProgressUpdate {
        match self {
            Self::Fraction(fraction) => ProgressUpdate::Advanced {
                file: UNATTRIBUTED_FILE.to_owned(),
                percent: fraction * 100.0,
                loaded_bytes: None,
            },
            Self::Record {
                status,
                file,
                percent,
                loaded_bytes,
            } => {
                let file = file.unwrap_or_else(|| UNATTRIBUTED_FILE.to_owned());
                match status {
                    RecordStatus::Started => ProgressUpdate::Started { file },
                    RecordStatus::Progress => ProgressUpdate::Advanced {
                        file,
                        percent: percent.unwrap_or(0.0),
                        loaded_bytes,
                    },
                    RecordStatus::Done => ProgressUpdate::Finished { file },
                }
            }
        }
    }
}

/// Callback type for raw download progress signals.
///
/// `Arc` rather than `Box` because downloads run on blocking threads while
/// the caller keeps its own handle.
pub type SignalCallback = Arc<dyn Fn(ProgressSignal) + Send + Sync>;

/// Aggregates per-file download percentages into one overall number.
///
/// Values are clamped to `[0, 100]` on every update. The overall percentage
/// is the mean over all files ever seen; an empty tracker reports 0.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    weighting: CompletionWeighting,
    in_progress: BTreeMap<String, f64>,
    completed: BTreeSet<String>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(weighting: CompletionWeighting) -> Self {
        Self {
            weighting,
            in_progress: BTreeMap::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Store the clamped percentage for `file` and return the new overall.
    ///
    /// An unseen file is registered by this call, so the denominator can
    /// never undercount a file that reports progress before registration.
    pub fn update(&mut self, file: &str, percent: f64) -> f64 {
        if self.completed.contains(file) {
            // Late progress for an already-counted file must not resurrect it.
            return self.overall();
        }
        self.in_progress
            .insert(file.to_owned(), percent.clamp(0.0, 100.0));
        self.overall()
    }

    /// Mark `file` finished and return the new overall.
    ///
    /// Idempotent in both modes: completing the same file twice neither
    /// grows the denominator nor double-counts the 100.
    pub fn complete(&mut self, file: &str) -> f64 {
        match self.weighting {
            CompletionWeighting::Retained => {
                self.in_progress.insert(file.to_owned(), 100.0);
            }
            CompletionWeighting::Counted => {
                if !self.completed.contains(file) {
                    self.in_progress.remove(file);
                    self.completed.insert(file.to_owned());
                }
            }
        }
        self.overall()
    }

    /// Apply a normalized update and return the new overall.
    pub fn apply(&mut self, update: &ProgressUpdate) -> f64 {
        match update {
            ProgressUpdate::Started { file } => self.update(file, 0.0),
            ProgressUpdate::Advanced { file, percent, .. } => self.update(file, *percent),
            ProgressUpdate::Finished { file } => self.complete(file),
        }
    }

    /// Overall percentage across all tracked files; 0 when nothing tracked.
    #[must_use]
    pub fn overall(&self) -> f64 {
        let total = self.total_files();
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = self.in_progress.values().sum::<f64>()
            + 100.0 * self.completed.len() as f64;
        sum / total as f64
    }

    /// Number of files ever seen (the denominator).
    #[must_use]
    pub fn total_files(&self) -> usize {
        self.in_progress.len() + self.completed.len()
    }

    /// Number of files counted as finished (fixed-denominator mode only;
    /// always 0 in `Retained` mode).
    #[must_use]
    pub fn loaded_files(&self) -> usize {
        self.completed.len()
    }

    /// Clear all tracked state; called at the start of each load cycle.
    pub fn reset(&mut self) {
        self.in_progress.clear();
        self.completed.clear();
    }
}
