//! # Command-Line Interface / 命令行接口
//!
//! The `grove-runner` companion binary: merges shard reports and writes a
//! default run config. Test binaries themselves go through [`crate::harness`].
//!
//! `grove-runner` 配套二进制：合并分片报告并写入默认运行配置。
//! 测试二进制本身通过 [`crate::harness`] 运行。

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

use crate::core::aggregate::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::core::config::DEFAULT_CONFIG_FILE;
use crate::{commands, t};

fn build_cli(locale: &str) -> Command {
    Command::new("grove-runner")
        .version(env!("CARGO_PKG_VERSION"))
        .about(t!("cli_about", locale = locale).to_string())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("lang")
                .long("lang")
                .help(t!("cli_lang", locale = locale).to_string())
                .value_name("LANGUAGE")
                .global(true)
                .action(ArgAction::Set),
        )
        .subcommand(
            Command::new("merge")
                .about(t!("cmd_merge_about", locale = locale).to_string())
                .arg(
                    Arg::new("reports")
                        .help(t!("arg_reports", locale = locale).to_string())
                        .value_name("REPORT")
                        .required(true)
                        .num_args(1..)
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help(t!("arg_json", locale = locale).to_string())
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("init")
                .about(t!("cmd_init_about", locale = locale).to_string())
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help(t!("arg_force", locale = locale).to_string())
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("non-interactive")
                        .long("non-interactive")
                        .help(t!("arg_non_interactive", locale = locale).to_string())
                        .action(ArgAction::SetTrue),
                ),
        )
}

/// Parses the command line and runs the chosen subcommand. Returns the
/// process exit status.
pub fn run() -> Result<u8> {
    let args: Vec<String> = std::env::args().collect();
    let language = crate::detect_language(&args);
    rust_i18n::set_locale(&language);

    let matches = build_cli(&language).get_matches_from(&args);

    match matches.subcommand() {
        Some(("merge", merge_matches)) => {
            let reports: Vec<PathBuf> = merge_matches
                .get_many::<PathBuf>("reports")
                .map(|paths| paths.cloned().collect())
                .unwrap_or_default();
            let output = merge_matches.get_one::<PathBuf>("json");
            let merged = commands::merge::merge_reports(&reports, output.map(PathBuf::as_path), &language)?;
            Ok(if merged.success { EXIT_SUCCESS } else { EXIT_FAILURE })
        }
        Some(("init", init_matches)) => {
            commands::init::run_init(
                &language,
                std::path::Path::new(DEFAULT_CONFIG_FILE),
                init_matches.get_flag("force"),
                init_matches.get_flag("non-interactive"),
            )?;
            Ok(EXIT_SUCCESS)
        }
        // `subcommand_required` makes clap print help and exit before this.
        _ => Ok(EXIT_SUCCESS),
    }
}
