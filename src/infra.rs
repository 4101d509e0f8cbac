//! # Infrastructure Module / 基础设施模块
//!
//! This module provides the worker backends Grove Runner launches units on:
//! dedicated threads and child processes.
//!
//! 此模块提供 Grove Runner 运行测试单元所用的 worker 后端：专用线程和子进程。

pub mod worker;

pub use worker::{ProcessLauncher, ThreadLauncher};
