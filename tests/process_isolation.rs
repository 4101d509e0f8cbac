//! # Process Isolation Tests / 进程隔离测试
//!
//! A `harness = false` test binary that runs its own suites on child-process
//! workers. Started with the worker flag, the binary serves units instead.
//!
//! 一个 `harness = false` 的测试二进制，在子进程 worker 上运行自己的测试套件。
//! 带 worker 参数启动时，该二进制改为提供测试单元服务。

use grove_runner::core::config::RunConfig;
use grove_runner::core::error::UnitError;
use grove_runner::harness::{self, HarnessOptions};
use grove_runner::infra::ProcessLauncher;
use grove_runner::infra::worker::WORKER_FLAG;
use grove_runner::{SuiteRegistry, crash_worker};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MARKER_ENV: &str = "GROVE_CRASH_MARKER";

fn always_crash() -> anyhow::Result<()> {
    crash_worker("every attempt")
}

fn registry() -> SuiteRegistry {
    let mut registry = SuiteRegistry::new();
    registry
        .register("ok/flaky", |s| {
            // Crashes the first process that runs it, passes on the retry.
            s.test("recovers", |_| async {
                let marker = PathBuf::from(std::env::var(MARKER_ENV)?);
                if !marker.exists() {
                    std::fs::write(&marker, "crashed once")?;
                    crash_worker("first attempt");
                }
                Ok(())
            });
            Ok(())
        })
        .register("ok/stable", |s| {
            s.describe("math", |s| {
                s.test("adds", |_| async {
                    let sum: i32 = [1, 1].iter().sum();
                    anyhow::ensure!(sum == 2, "got {sum}");
                    Ok(())
                });
                s.todo("divides");
            });
            Ok(())
        })
        .register("ok/prints", |s| {
            s.test("writes to stdout", |_| async {
                println!("plain output from a worker process");
                Ok(())
            });
            Ok(())
        })
        .register("ok/partial", |s| {
            // No newline: the next frame lands on the same stdout line.
            s.test("writes a partial line", |_| async {
                print!("partial output ");
                std::io::stdout().flush()?;
                Ok(())
            });
            Ok(())
        })
        .register("doomed", |s| {
            s.test("always crashes", |_| async { always_crash() });
            Ok(())
        });
    registry
}

fn options(filter: &str, retries: u32, marker: &std::path::Path) -> anyhow::Result<HarnessOptions> {
    let launcher = ProcessLauncher::current_exe()?.env(MARKER_ENV, marker);
    let config = RunConfig {
        max_workers: 2,
        worker_retries: retries,
        ..RunConfig::default()
    };
    Ok(HarnessOptions {
        filter: Some(filter.to_string()),
        console: false,
        launcher: Some(Arc::new(launcher)),
        ..HarnessOptions::new(config)
    })
}

async fn crashed_unit_is_retried_in_a_new_process(dir: &std::path::Path) -> anyhow::Result<()> {
    let marker = dir.join("marker");
    let report = harness::run(registry(), options("ok/", 2, &marker)?, CancellationToken::new()).await?;

    anyhow::ensure!(report.success, "run failed: {:?}", report.units);
    anyhow::ensure!(report.totals.units == 4);
    anyhow::ensure!(report.totals.passed == 4 && report.totals.todo == 1);
    anyhow::ensure!(marker.exists(), "the flaky unit never crashed");
    Ok(())
}

async fn exhausted_retries_are_reported(dir: &std::path::Path) -> anyhow::Result<()> {
    let marker = dir.join("unused");
    let report = harness::run(registry(), options("doomed", 0, &marker)?, CancellationToken::new()).await?;

    anyhow::ensure!(!report.success);
    anyhow::ensure!(report.exit_code(false) == 1);
    match &report.units[0].fatal {
        Some(UnitError::WorkerCrashed { attempts: 1, .. }) => Ok(()),
        other => anyhow::bail!("expected a worker crash, got {other:?}"),
    }
}

fn main() -> ExitCode {
    if std::env::args_os().any(|arg| arg == WORKER_FLAG) {
        return harness::main(registry());
    }

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let dir = tempfile::tempdir().expect("tempdir");
    let checks = [
        (
            "crashed_unit_is_retried_in_a_new_process",
            runtime.block_on(crashed_unit_is_retried_in_a_new_process(dir.path())),
        ),
        (
            "exhausted_retries_are_reported",
            runtime.block_on(exhausted_retries_are_reported(dir.path())),
        ),
    ];

    let mut failed = 0;
    for (name, outcome) in &checks {
        match outcome {
            Ok(()) => println!("test {name} ... ok"),
            Err(err) => {
                failed += 1;
                println!("test {name} ... FAILED: {err:#}");
            }
        }
    }
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
