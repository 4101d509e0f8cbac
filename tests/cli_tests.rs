use assert_cmd::prelude::*;
use chrono::Utc;
use grove_runner::core::aggregate::RunReport;
use grove_runner::core::models::{CaseResult, CaseStatus, TaskResult, TestUnit};
use grove_runner::reporting::{read_report, write_report};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn grove() -> Command {
    let mut cmd = Command::cargo_bin("grove-runner").unwrap();
    cmd.env("NO_COLOR", "1").arg("--lang").arg("en");
    cmd
}

/// Writes a one-unit shard report whose cases have the given statuses.
fn write_shard(path: &Path, unit: &str, statuses: &[CaseStatus], duration_ms: u64) {
    let result = TaskResult {
        unit: TestUnit::new(unit),
        cases: statuses
            .iter()
            .enumerate()
            .map(|(i, status)| CaseResult {
                path: vec![unit.to_string(), format!("case {i}")],
                status: *status,
                duration_ms: Some(1),
                errors: vec![],
            })
            .collect(),
        hook_errors: vec![],
        fatal: None,
        duration_ms,
        interrupted: false,
    };
    let report = RunReport::from_results(Utc::now(), vec![(0, result)], duration_ms);
    write_report(&report, path).unwrap();
}

/// `init --non-interactive` writes a loadable default config into the
/// working directory.
///
/// `init --non-interactive` 在工作目录中写入可加载的默认配置。
#[test]
fn test_init_writes_default_config() {
    let dir = tempdir().unwrap();

    grove()
        .current_dir(dir.path())
        .args(["init", "--non-interactive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created Grove.toml"));

    let text = fs::read_to_string(dir.path().join("Grove.toml")).unwrap();
    assert!(text.contains("isolation = \"thread\""));
    assert!(text.contains("test_timeout_ms = 5000"));
}

/// An existing config is left alone unless `--force` is given.
///
/// 除非指定 `--force`，否则已有配置保持不变。
#[test]
fn test_init_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("Grove.toml"), "max_workers = 3\n").unwrap();

    grove()
        .current_dir(dir.path())
        .args(["init", "--non-interactive"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(
        fs::read_to_string(dir.path().join("Grove.toml")).unwrap(),
        "max_workers = 3\n"
    );

    grove()
        .current_dir(dir.path())
        .args(["init", "--non-interactive", "--force"])
        .assert()
        .success();
    assert!(!fs::read_to_string(dir.path().join("Grove.toml")).unwrap().contains("max_workers = 3\n"));
}

/// Merging two passing shards succeeds and writes the combined report.
///
/// 合并两个通过的分片会成功并写出合并后的报告。
#[test]
fn test_merge_passing_shards() {
    let dir = tempdir().unwrap();
    let (a, b, out) = (
        dir.path().join("a.json"),
        dir.path().join("b.json"),
        dir.path().join("merged.json"),
    );
    write_shard(&a, "math", &[CaseStatus::Passed, CaseStatus::Passed], 40);
    write_shard(&b, "strings", &[CaseStatus::Passed, CaseStatus::Todo], 70);

    grove()
        .arg("merge")
        .arg(&a)
        .arg(&b)
        .arg("--json")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"))
        .stdout(predicate::str::contains("Tests:  3 passed, 0 failed, 0 skipped, 1 todo, 4 total"));

    let merged = read_report(&out).unwrap();
    assert_eq!(merged.totals.units, 2);
    assert_eq!(merged.duration_ms, 70);
    assert_eq!(merged.units[0].unit, TestUnit::new("math"));
}

/// A failing shard fails the merged run.
///
/// 失败的分片会使合并后的运行失败。
#[test]
fn test_merge_with_failed_shard() {
    let dir = tempdir().unwrap();
    let (a, b) = (dir.path().join("a.json"), dir.path().join("b.json"));
    write_shard(&a, "math", &[CaseStatus::Passed], 10);
    write_shard(&b, "db", &[CaseStatus::Failed], 10);

    grove()
        .arg("merge")
        .arg(&a)
        .arg(&b)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Failures in 'db'"))
        .stdout(predicate::str::contains("Some tests failed."));
}

/// A missing report is a setup error.
///
/// 缺失的报告属于设置错误。
#[test]
fn test_merge_missing_report() {
    let dir = tempdir().unwrap();
    grove()
        .arg("merge")
        .arg(dir.path().join("absent.json"))
        .assert()
        .code(2);
}
