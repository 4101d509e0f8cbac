//! # Commands Module / 命令模块
//!
//! Subcommands of the `grove-runner` companion binary.
//!
//! `grove-runner` 配套二进制的子命令。

pub mod init;
pub mod merge;
