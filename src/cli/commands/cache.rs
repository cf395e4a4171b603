//! Cache command - inspect and clean the block cache

use crate::cache::{BestEffort, CleanupReport};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::error::GfsResult;
use crate::facade::Gfs;
use console::style;

/// Execute the cache command
pub fn execute(args: CacheArgs, gfs: &Gfs) -> GfsResult<()> {
    match args.action {
        CacheAction::Path => {
            println!("{}", gfs.cache().dir().display());
            Ok(())
        }
        CacheAction::Clean { format } => clean(gfs, format),
        CacheAction::Purge { url } => purge(gfs, &url),
    }
}

fn clean(gfs: &Gfs, format: OutputFormat) -> GfsResult<()> {
    let report = gfs.cache().cleanup()?;

    match format {
        OutputFormat::Table => print_report_table(&report),
        OutputFormat::Json => print_report_json(&report)?,
        OutputFormat::Plain => {
            for path in report.evicted.iter().chain(&report.temp_removed) {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

fn print_report_table(report: &CleanupReport) {
    println!("{:<20} {}", "ENTRIES", report.entries);
    println!("{:<20} {}", "STALE BLOCKS", report.purged);
    println!("{:<20} {}", "EVICTED", report.evicted.len());
    println!("{:<20} {}", "TEMP DIRS REMOVED", report.temp_removed.len());
    println!("{:<20} {}", "BUSY (SKIPPED)", report.skipped.len());
    println!(
        "{:<20} {} -> {}",
        "BYTES",
        format_bytes(report.bytes_before),
        format_bytes(report.bytes_after)
    );

    for failure in &report.failures {
        if let BestEffort::Failed { action, error } = failure {
            println!("{} {}: {}", style("!").yellow(), action, error);
        }
    }
}

fn print_report_json(report: &CleanupReport) -> GfsResult<()> {
    #[derive(serde::Serialize)]
    struct ReportJson {
        entries: usize,
        purged: usize,
        evicted: Vec<String>,
        temp_removed: Vec<String>,
        skipped: Vec<String>,
        bytes_before: u64,
        bytes_after: u64,
        failures: Vec<String>,
    }

    let paths = |list: &[std::path::PathBuf]| {
        list.iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
    };
    let json = ReportJson {
        entries: report.entries,
        purged: report.purged,
        evicted: paths(&report.evicted),
        temp_removed: paths(&report.temp_removed),
        skipped: paths(&report.skipped),
        bytes_before: report.bytes_before,
        bytes_after: report.bytes_after,
        failures: report
            .failures
            .iter()
            .filter_map(|f| match f {
                BestEffort::Failed { action, error } => Some(format!("{}: {}", action, error)),
                BestEffort::Done => None,
            })
            .collect(),
    };

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn purge(gfs: &Gfs, url: &str) -> GfsResult<()> {
    let (_, url) = gfs.resolve_fs(url)?;
    if gfs.cache().purge(&url)? {
        println!("{} Purged {}", style("✓").green(), url);
    } else {
        println!("Nothing cached for {}", url);
    }
    Ok(())
}

/// Format bytes into human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
