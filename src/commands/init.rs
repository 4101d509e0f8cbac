//! # Config Initialization Module / 配置初始化模块
//!
//! This module writes a `Grove.toml` run configuration, either with the
//! defaults or through a short interactive wizard.
//!
//! 此模块写入 `Grove.toml` 运行配置，可使用默认值，也可通过简短的交互式向导生成。
//!
//! ## Features / 功能特性
//!
//! - **Interactive Wizard**: Asks for isolation mode, worker count and default timeout
//! - **Overwrite Protection**: Confirmation prompt before overwriting an existing file
//!
//! - **交互式向导**: 询问隔离模式、worker 数量和默认超时
//! - **覆盖保护**: 覆盖现有文件前的确认提示

use anyhow::{Context, Result, bail};
use colored::*;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use std::fs;
use std::path::Path;

use crate::core::config::{Isolation, RunConfig};
use crate::t;

/// Writes a run config to `path`.
///
/// An existing file is only replaced with `force`, or after the user confirms
/// in interactive mode.
///
/// 将运行配置写入 `path`。
/// 仅在指定 `force` 或用户在交互模式中确认后才会替换已有文件。
pub fn run_init(language: &str, path: &Path, force: bool, non_interactive: bool) -> Result<()> {
    let theme = ColorfulTheme::default();

    if !non_interactive {
        println!("\n{}", t!("init_wizard_welcome", locale = language).cyan().bold());
        println!("{}", t!("init_wizard_description", locale = language));
    }

    if path.exists() && !force {
        if non_interactive {
            bail!(t!("init_exists", locale = language, path = path.display()).to_string());
        }
        let confirmation = Confirm::with_theme(&theme)
            .with_prompt(t!("init_overwrite_prompt", locale = language, path = path.display()))
            .default(false)
            .interact()
            .context(t!("init_user_confirmation_failed", locale = language).to_string())?;
        if !confirmation {
            println!("{}", t!("init_aborted", locale = language));
            return Ok(());
        }
    }

    let mut config = RunConfig {
        language: language.to_string(),
        ..RunConfig::default()
    };

    if !non_interactive {
        let modes = [
            t!("init_isolation_thread", locale = language),
            t!("init_isolation_process", locale = language),
        ];
        let choice = Select::with_theme(&theme)
            .with_prompt(t!("init_isolation_prompt", locale = language))
            .items(&modes)
            .default(0)
            .interact()
            .context(t!("init_user_confirmation_failed", locale = language).to_string())?;
        config.isolation = if choice == 1 {
            Isolation::Process
        } else {
            Isolation::Thread
        };

        config.max_workers = Input::with_theme(&theme)
            .with_prompt(t!("init_workers_prompt", locale = language))
            .default(config.max_workers)
            .interact_text()
            .context(t!("init_user_confirmation_failed", locale = language).to_string())?;

        config.test_timeout_ms = Input::with_theme(&theme)
            .with_prompt(t!("init_timeout_prompt", locale = language))
            .default(config.test_timeout_ms)
            .interact_text()
            .context(t!("init_user_confirmation_failed", locale = language).to_string())?;
    }

    write_config(path, &config, language)
}

fn write_config(path: &Path, config: &RunConfig, language: &str) -> Result<()> {
    let toml_string = config
        .to_toml()
        .context(t!("init_serialize_failed", locale = language).to_string())?;

    fs::write(path, toml_string)
        .with_context(|| t!("init_write_failed", locale = language, path = path.display()).to_string())?;

    println!(
        "\n{} {}",
        "✔".green(),
        t!("init_success_created", locale = language, path = path.display()).bold()
    );
    println!("{}", t!("init_usage_hint", locale = language));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_a_loadable_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Grove.toml");
        run_init("en", &path, false, true).unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.test_timeout_ms, 5_000);
        assert_eq!(config.isolation, Isolation::Thread);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Grove.toml");
        fs::write(&path, "max_workers = 3\n").unwrap();

        assert!(run_init("en", &path, false, true).is_err());
        assert_eq!(RunConfig::load(&path).unwrap().max_workers, 3);

        run_init("en", &path, true, true).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), RunConfig::default());
    }
}
