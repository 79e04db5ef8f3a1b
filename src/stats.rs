//! Reports produced by activation and offline download.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::manifest::ResourceKey;

/// Which activation path ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// No stored manifest: content was rebuilt from the staged core set.
    ColdStart,
    /// Stored manifest present: unchanged resources were reused.
    Upgrade,
}

/// Summary of a successful activation.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub kind: ActivationKind,
    /// Cached entries that survived the reuse filter.
    pub kept: usize,
    /// Cached entries evicted because they were removed or changed.
    pub evicted: usize,
    /// Entries copied from the staging partition.
    pub promoted: usize,
    pub elapsed: Duration,
}

/// How an activation ended. Both variants leave the instance active.
#[derive(Debug)]
pub enum ActivationOutcome {
    Activated(ActivationReport),
    /// A step failed; every partition was deleted and the next cycle
    /// starts cold.
    Reset {
        cause: Error,
    },
}

impl ActivationOutcome {
    #[must_use]
    pub const fn report(&self) -> Option<&ActivationReport> {
        match self {
            Self::Activated(report) => Some(report),
            Self::Reset { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

/// Summary of an offline download.
#[derive(Debug, Clone, Default)]
pub struct OfflineReport {
    /// Resources fetched and stored by this run.
    pub cached: usize,
    /// Manifest resources that were already in the content partition.
    pub already_cached: usize,
    /// Resources that could not be cached, with the reason.
    pub failed: Vec<(ResourceKey, String)>,
    /// Body bytes stored by this run.
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl OfflineReport {
    /// Whether every manifest resource is now cached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Builder for accumulating an [`OfflineReport`] while downloads finish.
pub struct OfflineReportBuilder {
    report: OfflineReport,
    start_time: Instant,
}

impl Default for OfflineReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineReportBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            report: OfflineReport::default(),
            start_time: Instant::now(),
        }
    }

    pub const fn set_already_cached(&mut self, count: usize) {
        self.report.already_cached = count;
    }

    pub fn add_cached(&mut self, bytes: u64) {
        self.report.cached += 1;
        self.report.total_bytes += bytes;
    }

    pub fn add_failure(&mut self, key: ResourceKey, reason: impl Into<String>) {
        self.report.failed.push((key, reason.into()));
    }

    #[must_use]
    pub fn build(mut self) -> OfflineReport {
        self.report.elapsed = self.start_time.elapsed();
        self.report.failed.sort();
        self.report
    }
}
