//! # Core Module / 核心模块
//!
//! This module contains the core functionality of Grove Runner: the value
//! and transport model, suite trees and their executor, the worker pool,
//! configuration, planning and result aggregation.
//!
//! 此模块包含 Grove Runner 的核心功能：值与传输模型、测试树及其执行器、
//! worker 池、配置、执行计划和结果聚合。

pub mod aggregate;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod planner;
pub mod pool;
pub mod registry;
pub mod suite;
pub mod transport;
pub mod value;

// Re-exports
pub use aggregate::RunReport;
pub use config::RunConfig;
pub use execution::run_unit;
pub use models::TaskResult;
