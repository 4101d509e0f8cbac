//! # JSON Reporting Module / JSON 报告模块
//!
//! Writes the final [`RunReport`] as pretty-printed JSON, and reads it back so
//! shard reports can be merged.
//!
//! 将最终的 [`RunReport`] 写为格式化的 JSON，并支持读回以合并分片报告。

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::core::aggregate::RunReport;
use crate::core::events::{Reporter, RunEvent};

pub fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
}

pub fn read_report(path: &Path) -> Result<RunReport> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid report file {}", path.display()))
}

/// Writes the report to `path` once the run completes.
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    fn on_event(&mut self, _event: &RunEvent) {}

    fn on_run_complete(&mut self, report: &RunReport) {
        if let Err(err) = write_report(report, &self.path) {
            error!(path = %self.path.display(), error = %format!("{err:#}"), "failed to write JSON report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn reports_survive_a_trip_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports/shard-0.json");
        let report = RunReport::from_results(Utc::now(), vec![], 3);

        let mut reporter = JsonReporter::new(&path);
        reporter.on_run_complete(&report);

        assert_eq!(read_report(&path).unwrap(), report);
    }

    #[test]
    fn unreadable_reports_name_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        let err = read_report(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
