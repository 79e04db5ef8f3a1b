//! Progress bar and summary reporting for CLI synchronization.

use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};

use crate::{ActivationKind, ActivationOutcome, OfflineReport, ResourceKey, SyncProgress};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Offline download progress rendered as a single bar over the missing
/// resources.
pub struct OfflineProgressBar {
    bar: ProgressBar,
}

impl OfflineProgressBar {
    pub fn new(missing: u64) -> Self {
        let bar = ProgressBar::new(missing);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} resources - {msg}",
            )
            .expect("progress template is valid")
            .progress_chars("━━╌"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl SyncProgress for OfflineProgressBar {
    fn on_resource_start(&self, key: &ResourceKey) {
        self.bar.set_message(key.to_string());
    }

    fn on_resource_cached(&self, _key: &ResourceKey, _bytes: u64) {
        self.bar.inc(1);
    }

    fn on_error(&self, key: &ResourceKey, error: &str) {
        self.bar.println(format!("  failed {key}: {error}"));
        self.bar.inc(1);
    }
}

/// Prints what an activation did.
pub fn print_activation(outcome: &ActivationOutcome) {
    println!("\n{SEPARATOR}");
    println!("Activation");
    println!("{SEPARATOR}");

    match outcome {
        ActivationOutcome::Activated(report) => {
            let kind = match report.kind {
                ActivationKind::ColdStart => "cold start",
                ActivationKind::Upgrade => "upgrade",
            };
            println!("  Path:              {kind}");
            println!("  Promoted:          {}", report.promoted);
            println!("  Kept:              {}", report.kept);
            println!("  Evicted:           {}", report.evicted);
            println!("  Time:              {}", HumanDuration(report.elapsed));
        }
        ActivationOutcome::Reset { cause } => {
            println!("  Cache reset after failure: {cause}");
            println!("  The next activation starts cold.");
        }
    }

    println!("{SEPARATOR}");
}

/// Prints a summary of an offline download.
pub fn print_offline_summary(report: &OfflineReport) {
    println!("\n{SEPARATOR}");
    println!("Offline Download Summary");
    println!("{SEPARATOR}");

    println!("  Resources cached:  {}", report.cached);
    if report.cached > 0 {
        println!("  Total size:        {}", HumanBytes(report.total_bytes));
        println!("  Total time:        {}", HumanDuration(report.elapsed));
    }
    if report.already_cached > 0 {
        println!("  Already cached:    {}", report.already_cached);
    }
    if !report.failed.is_empty() {
        println!("  Failed:            {}", report.failed.len());
        for (key, reason) in &report.failed {
            println!("    {key}: {reason}");
        }
    }

    println!("{SEPARATOR}");
}
