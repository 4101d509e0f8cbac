//! # Console Reporting Module / 控制台报告模块
//!
//! This module prints run progress and the final summary to the console.
//! It provides colorful, formatted output with internationalization support.
//!
//! 此模块在控制台打印运行进度和最终摘要。
//! 它提供带国际化支持的彩色格式化输出。

use colored::*;

use crate::core::aggregate::RunReport;
use crate::core::events::{Reporter, RunEvent};
use crate::core::models::{CaseStatus, TaskResult};
use crate::t;

/// Prints progress lines as units finish and a summary at the end.
/// 在单元完成时打印进度行，并在结束时打印摘要。
pub struct ConsoleReporter {
    locale: String,
}

impl ConsoleReporter {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }
}

fn unit_status(result: &TaskResult, locale: &str) -> ColoredString {
    if result.fatal.is_some() {
        t!("status_error", locale = locale).to_string().red().bold()
    } else if result.is_failure() {
        t!("status_fail", locale = locale).to_string().red().bold()
    } else {
        t!("status_pass", locale = locale).to_string().green().bold()
    }
}

impl Reporter for ConsoleReporter {
    fn on_event(&mut self, event: &RunEvent) {
        let locale = self.locale.as_str();
        match event {
            RunEvent::RunStart { units, workers } => {
                println!(
                    "{}",
                    t!("run_start", locale = locale, units = units, workers = workers).cyan()
                );
            }
            RunEvent::UnitStart {
                unit,
                worker,
                attempt,
            } if *attempt > 1 => {
                println!(
                    "{}",
                    t!(
                        "unit_retrying",
                        locale = locale,
                        name = unit,
                        attempt = attempt,
                        worker = worker
                    )
                    .yellow()
                );
            }
            RunEvent::CaseFailure { path, .. } => {
                println!("    {} {}", "✗".red(), path.join(" › ").red());
            }
            RunEvent::UnitFinish { result } => {
                let mut line = format!(
                    "{} {} ({} ms)",
                    unit_status(result, locale),
                    result.unit,
                    result.duration_ms
                );
                if result.interrupted {
                    line.push_str(&format!(" {}", t!("unit_interrupted", locale = locale).yellow()));
                }
                println!("{line}");
            }
            _ => {}
        }
    }

    fn on_run_complete(&mut self, report: &RunReport) {
        print_failure_details(report, &self.locale);
        print_summary(report, &self.locale);
    }
}

/// Prints the per-unit table and the run totals.
///
/// 打印每个单元的表格和运行总计。
///
/// # Output Format / 输出格式
/// ```text
/// --- Test Summary ---
///   - PASS   | math                                     |  4 passed,  0 failed |     12 ms
///   - FAIL   | db/users                                 |  1 passed,  2 failed |    310 ms
/// ```
pub fn print_summary(report: &RunReport, locale: &str) {
    println!("\n{}", t!("test_summary_banner", locale = locale).bold());

    for result in &report.units {
        let counts = t!(
            "summary_counts",
            locale = locale,
            passed = format!("{:>2}", result.count(CaseStatus::Passed)),
            failed = format!("{:>2}", result.count(CaseStatus::Failed))
        );
        println!(
            "  - {:<6} | {:<40} | {} | {:>6} ms",
            unit_status(result, locale),
            result.unit,
            counts,
            result.duration_ms
        );
    }

    let totals = &report.totals;
    println!(
        "\n{}",
        t!(
            "summary_units",
            locale = locale,
            failed = totals.failed_units,
            total = totals.units
        )
    );
    println!(
        "{}",
        t!(
            "summary_cases",
            locale = locale,
            passed = totals.passed,
            failed = totals.failed,
            skipped = totals.skipped,
            todo = totals.todo,
            total = totals.cases()
        )
    );
    println!(
        "{}",
        t!("summary_time", locale = locale, ms = report.duration_ms)
    );

    if report.units.is_empty() {
        println!("\n{}", t!("no_units_to_run", locale = locale).yellow());
    } else if report.success {
        println!("\n{}", t!("all_tests_passed", locale = locale).green().bold());
    } else {
        println!("\n{}", t!("tests_failed", locale = locale).red().bold());
    }
}

/// Prints every failed case, after-all error and fatal unit error.
///
/// 打印每个失败的用例、afterAll 错误和单元致命错误。
pub fn print_failure_details(report: &RunReport, locale: &str) {
    let failed: Vec<&TaskResult> = report.units.iter().filter(|u| u.is_failure()).collect();
    if failed.is_empty() {
        return;
    }

    println!("\n{}", t!("failure_banner", locale = locale).red().bold());
    println!("{}", "-".repeat(80));

    for (i, result) in failed.iter().enumerate() {
        println!(
            "[{}/{}] {} '{}'",
            i + 1,
            failed.len(),
            t!("report_header_failure", locale = locale).red(),
            result.unit.to_string().cyan()
        );

        if let Some(fatal) = &result.fatal {
            println!("  {} {}", t!("fatal_error", locale = locale).red(), fatal);
        }
        for case in result.cases.iter().filter(|c| c.status == CaseStatus::Failed) {
            println!("\n  {} {}", "●".red(), case.path.join(" › ").bold());
            for error in &case.errors {
                for line in error.to_string().lines() {
                    println!("    {line}");
                }
            }
        }
        for hook_error in &result.hook_errors {
            let group = if hook_error.group.is_empty() {
                result.unit.to_string()
            } else {
                hook_error.group.join(" › ")
            };
            println!(
                "\n  {} {}",
                t!("hook_error_in", locale = locale, group = group).red(),
                hook_error.failure
            );
        }
        println!("\n{}", "-".repeat(80));
    }
}
