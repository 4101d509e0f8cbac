//! # Worker Backends / Worker 后端
//!
//! The two [`Launcher`]s and the loop a worker runs. A worker receives
//! [`ParentMessage`] lines, runs one unit at a time and answers with
//! [`ChildMessage`] lines; the same loop serves both backends.
//!
//! 两种 [`Launcher`] 以及 worker 运行的循环。worker 接收 [`ParentMessage`] 行，
//! 一次运行一个测试单元，并以 [`ChildMessage`] 行作答；两种后端共用同一循环。
//!
//! - [`ThreadLauncher`]: a named OS thread with a single-threaded runtime.
//! - [`ProcessLauncher`]: the current binary re-executed with `--grove-worker`,
//!   talking over stdin/stdout.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::execution::run_unit;
use crate::core::pool::{Launcher, WorkerLink};
use crate::core::registry::SuiteRegistry;
use crate::core::transport::{self, ChildMessage, ParentMessage};

/// The hidden flag that turns a harness binary into a worker process.
pub const WORKER_FLAG: &str = "--grove-worker";

fn send_message(outbox: &UnboundedSender<String>, message: &ChildMessage) -> bool {
    match transport::encode(message) {
        Ok(line) => outbox.send(line).is_ok(),
        Err(err) => {
            error!(error = %err, "failed to encode worker message");
            true
        }
    }
}

/// Serves tasks from `inbox` until it closes, a `Shutdown` arrives or `stop`
/// fires.
///
/// A `Cancel` received while a unit runs cancels that unit; the executor
/// then skips the cases it has not started yet.
pub async fn serve(
    registry: Arc<SuiteRegistry>,
    mut inbox: UnboundedReceiver<String>,
    outbox: UnboundedSender<String>,
    stop: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            line = inbox.recv() => line,
            _ = stop.cancelled() => None,
        };
        let Some(line) = line else { break };

        let task = match transport::decode::<ParentMessage>(&line) {
            Ok(Some(ParentMessage::Run { task })) => task,
            Ok(Some(ParentMessage::Cancel)) => continue,
            Ok(Some(ParentMessage::Shutdown)) => break,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "worker dropped a malformed message");
                continue;
            }
        };

        debug!(unit = %task.unit, attempt = task.attempt, "worker running unit");
        let cancel = stop.child_token();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut shutting_down = false;

        let execution = run_unit(&registry, &task.unit, task.settings, cancel.clone(), &events_tx);
        tokio::pin!(execution);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut execution => break result,
                Some(event) = events_rx.recv() => {
                    send_message(&outbox, &ChildMessage::Event { event });
                }
                message = inbox.recv(), if !shutting_down => {
                    match message.as_deref().map(transport::decode::<ParentMessage>) {
                        Some(Ok(Some(ParentMessage::Cancel))) => cancel.cancel(),
                        Some(Ok(Some(ParentMessage::Shutdown))) | None => {
                            cancel.cancel();
                            shutting_down = true;
                        }
                        Some(Ok(Some(ParentMessage::Run { task: other }))) => {
                            warn!(unit = %other.unit, "worker is busy, dropped a second task");
                        }
                        Some(Ok(None)) => {}
                        Some(Err(err)) => warn!(error = %err, "worker dropped a malformed message"),
                    }
                }
            }
        };

        while let Ok(event) = events_rx.try_recv() {
            send_message(&outbox, &ChildMessage::Event { event });
        }
        if !send_message(&outbox, &ChildMessage::Done { result }) || shutting_down {
            break;
        }
    }
    debug!("worker loop finished");
}

/// Runs workers on dedicated threads.
pub struct ThreadLauncher {
    registry: Arc<SuiteRegistry>,
}

impl ThreadLauncher {
    pub fn new(registry: Arc<SuiteRegistry>) -> Self {
        Self { registry }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, id: usize) -> io::Result<WorkerLink> {
        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, from_worker) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let registry = Arc::clone(&self.registry);
        let worker_stop = stop.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        std::thread::Builder::new()
            .name(format!("grove-worker-{id}"))
            .spawn(move || runtime.block_on(serve(registry, inbox, outbox, worker_stop)))?;

        Ok(WorkerLink {
            sender: to_worker,
            receiver: from_worker,
            // A thread cannot be killed: stop it at the next case and detach.
            terminate: Box::new(move || stop.cancel()),
        })
    }
}

/// Runs workers as child processes of a harness binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, id: usize) -> io::Result<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(WORKER_FLAG)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env("GROVE_WORKER_ID", id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;

        let (to_worker, mut inbox) = mpsc::unbounded_channel::<String>();
        let (outbox, from_worker) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(line) = inbox.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(err) = written.await {
                    debug!(worker = id, error = %err, "worker stdin closed");
                    break;
                }
            }
            // Dropping stdin closes the pipe, which a worker treats as shutdown.
        });

        let killed = kill.clone();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            loop {
                tokio::select! {
                    _ = killed.cancelled() => {
                        if let Err(err) = child.start_kill() {
                            warn!(worker = id, error = %err, "failed to kill worker process");
                        }
                        break;
                    }
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if outbox.send(line).is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(worker = id, error = %err, "failed to read worker output");
                            break;
                        }
                        None => break,
                    },
                }
            }
            match child.wait().await {
                Ok(status) => debug!(worker = id, %status, "worker process exited"),
                Err(err) => warn!(worker = id, error = %err, "failed to reap worker process"),
            }
        });

        Ok(WorkerLink {
            sender: to_worker,
            receiver: from_worker,
            terminate: Box::new(move || kill.cancel()),
        })
    }
}

/// Worker-process entry point: serves tasks over stdin and stdout.
pub async fn serve_stdio(registry: Arc<SuiteRegistry>) {
    let (to_worker, inbox) = mpsc::unbounded_channel();
    let (outbox, mut from_worker) = mpsc::unbounded_channel::<String>();

    let reader = tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
        while let Some(Ok(line)) = lines.next().await {
            if to_worker.send(line).is_err() {
                break;
            }
        }
    });
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = from_worker.recv().await {
            let frame = format!("{line}\n");
            if stdout.write_all(frame.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    serve(registry, inbox, outbox, CancellationToken::new()).await;
    if writer.await.is_err() {
        warn!("worker output writer failed");
    }
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{CaseStatus, TestUnit, UnitSettings, WorkerTask};

    fn run_message(unit: &str) -> String {
        transport::encode(&ParentMessage::Run {
            task: WorkerTask {
                unit: TestUnit::new(unit),
                settings: UnitSettings::default(),
                seq: 0,
                attempt: 1,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn serve_streams_events_then_the_result() {
        let mut registry = SuiteRegistry::new();
        registry.register("math", |s| {
            s.test("adds", |_| async { Ok(()) });
            Ok(())
        });

        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, mut from_worker) = mpsc::unbounded_channel();
        to_worker.send(run_message("math")).unwrap();
        to_worker.send(transport::encode(&ParentMessage::Shutdown).unwrap()).unwrap();

        serve(Arc::new(registry), inbox, outbox, CancellationToken::new()).await;

        let mut messages = Vec::new();
        while let Ok(line) = from_worker.try_recv() {
            messages.push(transport::decode::<ChildMessage>(&line).unwrap().unwrap());
        }
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], ChildMessage::Event { .. }));
        match &messages[2] {
            ChildMessage::Done { result } => {
                assert_eq!(result.cases[0].status, CaseStatus::Passed);
            }
            other => panic!("expected a result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_workers_exit_when_their_link_closes() {
        let launcher = ThreadLauncher::new(Arc::new(SuiteRegistry::new()));
        let WorkerLink {
            sender,
            mut receiver,
            ..
        } = launcher.launch(0).unwrap();
        drop(sender);
        assert!(receiver.recv().await.is_none());
    }
}
