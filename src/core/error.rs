//! # Error Taxonomy / 错误分类
//!
//! Declaration, hook, test and timeout errors are caught where they happen and
//! turned into [`Failure`] records. Only worker crashes escape to the
//! dispatcher, which turns them into a [`UnitError`] once retries run out.
//!
//! 声明错误、钩子错误、测试错误和超时错误都在发生处被捕获并转换为
//! [`Failure`] 记录。只有 worker 崩溃会逃逸到调度器，重试耗尽后成为 [`UnitError`]。

use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

use crate::core::models::{Failure, FailureKind};
use crate::core::transport;
use crate::core::value::Value;

/// A whole-unit failure that is not attributable to a single test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    #[error("failed to collect tests: {message}")]
    Collection { message: String },
    #[error("no suite is registered under this name")]
    UnknownUnit,
    #[error("worker crashed {attempts} time(s), retries were exceeded: {detail}")]
    WorkerCrashed { attempts: u32, detail: String },
    #[error("terminated before a result was reported")]
    Terminated,
    #[error("the run was cancelled before this unit finished")]
    Cancelled,
    #[error("no worker is left to run this unit")]
    PoolExhausted,
}

/// Errors that prevent the pool from starting at all.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("the worker pool needs at least one worker")]
    NoWorkers,
    #[error("failed to launch worker {id}: {source}")]
    Launch {
        id: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while building a suite tree.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0}")]
    Declaration(#[from] anyhow::Error),
    #[error("declaration panicked: {0}")]
    Panicked(String),
    #[error("invalid {hook}() in describe block \"{group}\": hooks may not be used in a describe block containing no tests")]
    HooksWithoutTests { hook: String, group: String },
}

/// An arbitrary value raised by test code, the way a script would `throw` it.
#[derive(Debug, Error)]
#[error("thrown: {0}")]
pub struct Thrown(pub Value);

/// Panic payload that takes the whole worker down instead of failing a test.
#[derive(Debug, Clone)]
pub struct WorkerCrash {
    pub reason: String,
}

/// Crashes the worker executing the current unit.
///
/// In a thread worker the panic unwinds the worker thread; in a process worker
/// it unwinds `main` and the process exits with a failure status. Either way
/// the dispatcher observes an exit without a result.
pub fn crash_worker(reason: impl Into<String>) -> ! {
    std::panic::resume_unwind(Box::new(WorkerCrash {
        reason: reason.into(),
    }))
}

/// Returns true if the panic payload is a deliberate worker crash.
pub fn is_worker_crash(payload: &(dyn Any + Send)) -> bool {
    payload.is::<WorkerCrash>()
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(value) = payload.downcast_ref::<Value>() {
        format!("thrown: {value}")
    } else if let Some(crash) = payload.downcast_ref::<WorkerCrash>() {
        format!("worker crash: {}", crash.reason)
    } else {
        "Box<dyn Any>".to_string()
    }
}

impl Failure {
    /// Converts an error returned by a body or hook.
    pub fn from_error(kind: FailureKind, error: &anyhow::Error) -> Self {
        let payload = error
            .downcast_ref::<Thrown>()
            .map(|thrown| transport::serialize(&thrown.0));
        Self {
            kind,
            hook: None,
            message: format!("{error:#}"),
            payload,
        }
    }

    /// Converts a contained panic.
    pub fn from_panic(kind: FailureKind, payload: &(dyn Any + Send)) -> Self {
        let transported = payload.downcast_ref::<Value>().map(transport::serialize);
        Self {
            kind,
            hook: None,
            message: panic_message(payload),
            payload: transported,
        }
    }
}
