//! # Test Harness / 测试 Harness
//!
//! Entry point for test binaries built with `harness = false`:
//!
//! 用于 `harness = false` 测试二进制的入口：
//!
//! ```no_run
//! use grove_runner::{SuiteRegistry, harness};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut registry = SuiteRegistry::new();
//!     registry.register("math", |s| {
//!         s.test("adds", |_| async { Ok(()) });
//!         Ok(())
//!     });
//!     harness::main(registry)
//! }
//! ```
//!
//! The same binary doubles as a worker process when started with the hidden
//! `--grove-worker` flag.
//!
//! 使用隐藏参数 `--grove-worker` 启动时，同一个二进制文件也充当 worker 进程。

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::ffi::OsString;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::core::aggregate::{EXIT_SETUP_ERROR, RunReport};
use crate::core::config::{ConfigOverrides, Isolation, RunConfig};
use crate::core::error::panic_message;
use crate::core::events::{ReporterSet, RunEvent};
use crate::core::planner;
use crate::core::pool::{Launcher, PoolOptions, WorkerPool};
use crate::core::registry::SuiteRegistry;
use crate::infra::worker::{self, ProcessLauncher, ThreadLauncher, WORKER_FLAG};
use crate::reporting::{ConsoleReporter, JsonReporter};
use crate::t;

/// Environment variable holding the `tracing` filter.
pub const LOG_ENV: &str = "GROVE_LOG";

/// Installs the diagnostic subscriber. Diagnostics go to stderr so a worker's
/// stdout carries nothing but protocol lines and test output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Everything a run needs besides the registry.
/// 除注册表之外，一次运行所需的全部内容。
pub struct HarnessOptions {
    pub config: RunConfig,
    /// Only units whose id contains this string run.
    pub filter: Option<String>,
    pub total_runners: Option<usize>,
    pub runner_index: Option<usize>,
    /// Where to write the JSON report.
    pub json: Option<PathBuf>,
    /// Print progress and the summary to the console.
    pub console: bool,
    /// Replaces the launcher chosen from `config.isolation`.
    pub launcher: Option<Arc<dyn Launcher>>,
}

impl HarnessOptions {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            filter: None,
            total_runners: None,
            runner_index: None,
            json: None,
            console: true,
            launcher: None,
        }
    }
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self::new(RunConfig::default())
    }
}

fn build_cli(locale: &str) -> Command {
    Command::new("grove")
        .about(t!("harness_about", locale = locale).to_string())
        .ignore_errors(true)
        .arg(
            Arg::new("filter")
                .help(t!("arg_filter", locale = locale).to_string())
                .value_name("FILTER")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help(t!("arg_config", locale = locale).to_string())
                .value_name("CONFIG")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("max-workers")
                .short('j')
                .long("max-workers")
                .help(t!("arg_max_workers", locale = locale).to_string())
                .value_name("WORKERS")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("max-concurrency")
                .long("max-concurrency")
                .help(t!("arg_max_concurrency", locale = locale).to_string())
                .value_name("CASES")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-timeout")
                .long("test-timeout")
                .help(t!("arg_test_timeout", locale = locale).to_string())
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("worker-retries")
                .long("worker-retries")
                .help(t!("arg_worker_retries", locale = locale).to_string())
                .value_name("RETRIES")
                .value_parser(clap::value_parser!(u32))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("isolation")
                .long("isolation")
                .help(t!("arg_isolation", locale = locale).to_string())
                .value_name("MODE")
                .value_parser(["thread", "process"])
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("bail")
                .long("bail")
                .help(t!("arg_bail", locale = locale).to_string())
                .value_name("FAILURES")
                .num_args(0..=1)
                .default_missing_value("1")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("total-runners")
                .long("total-runners")
                .help(t!("arg_total_runners", locale = locale).to_string())
                .value_name("TOTAL_RUNNERS")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set)
                .requires("runner-index"),
        )
        .arg(
            Arg::new("runner-index")
                .long("runner-index")
                .help(t!("arg_runner_index", locale = locale).to_string())
                .value_name("RUNNER_INDEX")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set)
                .requires("total-runners"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help(t!("arg_json", locale = locale).to_string())
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("pass-with-no-tests")
                .long("pass-with-no-tests")
                .help(t!("arg_pass_with_no_tests", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("lang")
                .long("lang")
                .help(t!("cli_lang", locale = locale).to_string())
                .value_name("LANGUAGE")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("grove-worker")
                .long("grove-worker")
                .hide(true)
                .action(ArgAction::SetTrue),
        )
}

/// Reads harness flags, the config file and the language.
fn options_from_matches(matches: &ArgMatches) -> Result<HarnessOptions> {
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let explicit = matches.get_one::<PathBuf>("config");
    let (mut config, path) = RunConfig::discover(explicit.map(PathBuf::as_path), &cwd)?;
    if let Some(path) = path {
        debug!(path = %path.display(), "loaded run config");
    }

    let isolation = matches
        .get_one::<String>("isolation")
        .map(|mode| mode.parse::<Isolation>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    config.apply(&ConfigOverrides {
        language: matches.get_one::<String>("lang").cloned(),
        max_workers: matches.get_one::<usize>("max-workers").copied(),
        max_concurrency: matches.get_one::<usize>("max-concurrency").copied(),
        test_timeout_ms: matches.get_one::<u64>("test-timeout").copied(),
        worker_retries: matches.get_one::<u32>("worker-retries").copied(),
        isolation,
        bail: matches.get_one::<usize>("bail").copied(),
        pass_with_no_tests: matches.get_flag("pass-with-no-tests"),
    })?;

    Ok(HarnessOptions {
        filter: matches.get_one::<String>("filter").cloned(),
        total_runners: matches.get_one::<usize>("total-runners").copied(),
        runner_index: matches.get_one::<usize>("runner-index").copied(),
        json: matches.get_one::<PathBuf>("json").cloned(),
        ..HarnessOptions::new(config)
    })
}

/// Cancels the returned token on Ctrl-C.
fn setup_signal_handler(locale: &str) -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();
    let locale = locale.to_string();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                println!("\n{}", t!("shutdown_signal", locale = &locale).yellow());
                token_clone.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        }
    });

    token
}

fn choose_launcher(options: &HarnessOptions, registry: &Arc<SuiteRegistry>) -> Result<Arc<dyn Launcher>> {
    if let Some(launcher) = &options.launcher {
        return Ok(Arc::clone(launcher));
    }
    Ok(match options.config.isolation {
        Isolation::Thread => Arc::new(ThreadLauncher::new(Arc::clone(registry))),
        Isolation::Process => Arc::new(
            ProcessLauncher::current_exe().context("Failed to locate the test binary")?,
        ),
    })
}

/// Runs every selected unit of `registry` and returns the report.
///
/// Fails only when the run cannot start (bad shard flags, no worker could be
/// launched). Test failures are part of the report.
pub async fn run(
    registry: SuiteRegistry,
    options: HarnessOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let locale = options.config.language.clone();
    let plan = planner::plan_execution(
        registry.units(),
        options.filter.as_deref(),
        options.total_runners,
        options.runner_index,
    )?;

    if options.console {
        if plan.filtered_count > 0 {
            println!(
                "{}",
                t!(
                    "filtered_units",
                    locale = &locale,
                    filtered = plan.filtered_count,
                    total = plan.units.len()
                )
                .cyan()
            );
        }
        if let (Some(total), Some(index)) = (options.total_runners, options.runner_index) {
            println!(
                "{}",
                t!(
                    "running_as_split_runner",
                    locale = &locale,
                    index = index + 1,
                    total = total,
                    count = plan.units.len()
                )
                .bold()
            );
        }
    }

    let mut reporters = ReporterSet::new();
    if options.console {
        reporters.add(ConsoleReporter::new(&locale));
    }
    if let Some(path) = &options.json {
        reporters.add(JsonReporter::new(path));
    }

    if plan.units.is_empty() {
        let report = RunReport::from_results(Utc::now(), Vec::new(), 0);
        reporters.emit(&RunEvent::RunStart {
            units: 0,
            workers: 0,
        });
        reporters.emit(&RunEvent::RunFinish {
            success: report.success,
        });
        reporters.complete(&report);
        return Ok(report);
    }

    let registry = Arc::new(registry);
    let launcher = choose_launcher(&options, &registry)?;
    let mut pool_options = PoolOptions::from_config(&options.config);
    pool_options.workers = pool_options.workers.min(plan.units.len());

    let pool = WorkerPool::start(launcher, pool_options, &mut reporters, &cancel)
        .context("Failed to start the worker pool")?;
    Ok(pool.run(plan.units).await)
}

/// Runs in worker mode: serves units over stdin and stdout.
fn worker_main(registry: SuiteRegistry) -> ExitCode {
    init_tracing();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start worker runtime: {err}");
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(worker::serve_stdio(Arc::new(registry)))
    }));
    // The stdin reader sits in a blocking read; do not wait for it.
    runtime.shutdown_background();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(payload) => {
            eprintln!("worker crashed: {}", panic_message(payload.as_ref()));
            ExitCode::FAILURE
        }
    }
}

/// Parses the command line, runs the registry and maps the report to an exit
/// status.
pub fn main(registry: SuiteRegistry) -> ExitCode {
    main_from(registry, std::env::args_os())
}

/// Like [`main`], with explicit arguments (the first one is the program name).
pub fn main_from(registry: SuiteRegistry, args: impl IntoIterator<Item = OsString>) -> ExitCode {
    let args: Vec<OsString> = args.into_iter().collect();
    if args.iter().any(|arg| arg == WORKER_FLAG) {
        return worker_main(registry);
    }
    init_tracing();

    let language = crate::detect_language(&args);
    let matches = build_cli(&language).get_matches_from(&args);
    let options = match options_from_matches(&matches) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{} {err:#}", t!("error_prefix", locale = &language).red());
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };
    rust_i18n::set_locale(&options.config.language);
    let pass_with_no_tests = options.config.pass_with_no_tests;

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{} {err}", t!("error_prefix", locale = &language).red());
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };

    let locale = options.config.language.clone();
    let outcome = runtime.block_on(async move {
        let cancel = setup_signal_handler(&locale);
        run(registry, options, cancel).await
    });
    match outcome {
        Ok(report) => ExitCode::from(report.exit_code(pass_with_no_tests)),
        Err(err) => {
            eprintln!("{} {err:#}", t!("error_prefix", locale = &language).red());
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}
