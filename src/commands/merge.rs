//! # Report Merge Module / 报告合并模块
//!
//! Combines the JSON reports of several CI shards into one report and prints
//! the combined summary.
//!
//! 将多个 CI 分片的 JSON 报告合并为一份报告，并打印合并后的摘要。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::core::aggregate::RunReport;
use crate::reporting::{print_failure_details, print_summary, read_report, write_report};

/// Merges `inputs`, optionally writes the result to `output`, and returns it.
pub fn merge_reports(inputs: &[PathBuf], output: Option<&Path>, locale: &str) -> Result<RunReport> {
    let reports = inputs
        .iter()
        .map(|path| read_report(path))
        .collect::<Result<Vec<_>>>()?;
    let merged = RunReport::merge(reports).context("No reports to merge")?;

    print_failure_details(&merged, locale);
    print_summary(&merged, locale);

    if let Some(path) = output {
        write_report(&merged, path)?;
    }
    Ok(merged)
}
