//! # Result Aggregator / 结果聚合器
//!
//! Folds per-unit results into run totals and a verdict. Results may arrive
//! in any order; the report always lists units in their original order.
//!
//! 将各单元的结果汇总为运行总计和最终结论。结果可以以任意顺序到达；
//! 报告始终按原始顺序列出测试单元。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::models::{CaseStatus, TaskResult};

/// Every unit passed.
pub const EXIT_SUCCESS: u8 = 0;
/// At least one case, hook or unit failed.
pub const EXIT_FAILURE: u8 = 1;
/// The run could not start.
pub const EXIT_SETUP_ERROR: u8 = 2;
/// No unit matched the filter.
pub const EXIT_NO_TESTS: u8 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub units: usize,
    pub failed_units: usize,
    /// Units that ended with a fatal error instead of case results.
    pub fatal_units: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    pub hook_errors: usize,
}

impl Totals {
    fn add(&mut self, result: &TaskResult) {
        self.units += 1;
        if result.is_failure() {
            self.failed_units += 1;
        }
        if result.fatal.is_some() {
            self.fatal_units += 1;
        }
        self.passed += result.count(CaseStatus::Passed);
        self.failed += result.count(CaseStatus::Failed);
        self.skipped += result.count(CaseStatus::Skipped);
        self.todo += result.count(CaseStatus::Todo);
        self.hook_errors += result.hook_errors.len();
    }

    pub fn cases(&self) -> usize {
        self.passed + self.failed + self.skipped + self.todo
    }
}

/// The outcome of a whole run.
/// 整个运行的结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    /// Per-unit results, in original unit order.
    pub units: Vec<TaskResult>,
    pub totals: Totals,
    pub success: bool,
    pub duration_ms: u64,
}

impl RunReport {
    /// Builds a report from `(sequence number, result)` pairs.
    pub fn from_results(
        started_at: DateTime<Utc>,
        mut results: Vec<(usize, TaskResult)>,
        duration_ms: u64,
    ) -> Self {
        results.sort_by_key(|(seq, _)| *seq);
        Self::from_ordered(
            started_at,
            results.into_iter().map(|(_, result)| result).collect(),
            duration_ms,
        )
    }

    fn from_ordered(started_at: DateTime<Utc>, units: Vec<TaskResult>, duration_ms: u64) -> Self {
        let mut totals = Totals::default();
        for result in &units {
            totals.add(result);
        }
        let success = totals.failed == 0 && totals.fatal_units == 0 && totals.hook_errors == 0;
        Self {
            started_at,
            units,
            totals,
            success,
            duration_ms,
        }
    }

    /// Combines the reports of several CI shards into one.
    ///
    /// Units keep the order of `reports`. The start time is the earliest one
    /// and the duration the longest, since shards run side by side.
    pub fn merge(reports: Vec<RunReport>) -> Option<Self> {
        let started_at = reports.iter().map(|r| r.started_at).min()?;
        let duration_ms = reports.iter().map(|r| r.duration_ms).max().unwrap_or(0);
        let units = reports.into_iter().flat_map(|r| r.units).collect();
        Some(Self::from_ordered(started_at, units, duration_ms))
    }

    /// Process exit status for this report.
    pub fn exit_code(&self, pass_with_no_tests: bool) -> u8 {
        if self.units.is_empty() && !pass_with_no_tests {
            EXIT_NO_TESTS
        } else if self.success {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }
}
