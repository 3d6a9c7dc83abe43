//! The controller: launches and supervises the worker process.
//!
//! Flow:
//! 1. Validate the configuration and build the command line
//! 2. Spawn the transport (pipes, or a loopback socket rendezvous)
//! 3. Drive the session read loop, routing frames to the task stack and
//!    the status builder
//! 4. On EOF or a terminal frame, reap the process with a bounded wait
//!    and diagnose the exit
//!
//! Ordinary job failures come back inside the returned status tree. Only
//! configuration and launch errors are `Err`, and both are raised before
//! the read loop starts.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use uuid::Uuid;

use crate::bridge::codec::{self, DecodeError, ExceptionPayload};
use crate::bridge::protocol::{ControlFrame, Frame};
use crate::bridge::transport::{self, ProcessHandle, SpawnError, WorkerTransport};
use crate::codes;
use crate::config::{ConfigError, FaultCode, LaunchConfig, LaunchPlan};
use crate::progress::{ProgressMonitor, StackEvent, TaskStack};
use crate::runlog::RunLog;
use crate::status::{Severity, StatusBuilder, StatusNode, SyntheticException};

/// Window of leading worker output kept for post-exit diagnosis.
const FIRST_LINES: usize = 3;
/// Consecutive full-GC lines tolerated before a low-memory warning.
const MAX_CONSECUTIVE_GCS: u32 = 3;

/// Known fatal JVM startup lines; any of these in the first output window
/// turns a bad exit into the memory-too-big diagnosis.
const FATAL_STARTUP_PREFIXES: [&str; 2] = [
    "Could not reserve enough space",
    "Invalid maximum heap size",
];

/// Failures raised before the session loop starts.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Launches one worker process and supervises it to completion.
pub struct Launcher {
    config: LaunchConfig,
    log: Arc<RunLog>,
    scan_id: Uuid,
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Self {
        let log = Arc::new(RunLog::open(config.verbose(), config.log_path()));
        Self {
            config,
            log,
            scan_id: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run the scan to completion and return the status tree.
    pub async fn run(self, monitor: &mut dyn ProgressMonitor) -> Result<StatusNode, LaunchError> {
        self.config.validate()?;
        let mut transport = self.spawn_transport().await?;

        let mut state = SessionState::new(&self.config);
        let end = drive_session(
            &mut transport.frames,
            &mut transport.sink,
            &mut transport.process,
            monitor,
            &mut state,
            &self.log,
        )
        .await;
        if state.begun {
            monitor.done();
        }
        let status = self.finalize(end, state, &mut transport.process).await;
        if let Some(relay) = transport.relay.take() {
            relay.abort();
        }
        Ok(status)
    }

    async fn spawn_transport(&self) -> Result<WorkerTransport, LaunchError> {
        let transport = if self.config.port() != 0 {
            let console = transport::bind_console(self.config.port()).await?;
            let plan = self.config.launch_plan(console.port);
            self.log_plan(&plan);
            transport::spawn_socket(
                &plan,
                console,
                self.config.accept_timeout(),
                Arc::clone(&self.log),
            )
            .await?
        } else {
            let plan = self.config.launch_plan(0);
            self.log_plan(&plan);
            transport::spawn_pipe(&plan).await?
        };
        tracing::info!(
            scan_id = %self.scan_id,
            job = %self.config.name(),
            "worker process started"
        );
        Ok(transport)
    }

    fn log_plan(&self, plan: &LaunchPlan) {
        self.log.line("starting worker process:");
        self.log.line(&format!("\t{}", plan.command_line()));
    }

    async fn finalize<P>(&self, end: SessionKind, state: SessionState, process: &mut P) -> StatusNode
    where
        P: ProcessHandle + ?Sized,
    {
        let heap = self.config.heap_mb().to_string();
        let SessionState {
            builder,
            first_lines,
            ..
        } = state;

        match end {
            SessionKind::Cancelled => builder.build(
                Severity::Cancel,
                codes::JOB_CANCELLED,
                codes::message(codes::JOB_CANCELLED, &[]),
            ),
            SessionKind::NoOutput => builder.build(
                Severity::Error,
                codes::NO_OUTPUT_FROM_JOB,
                codes::message(codes::NO_OUTPUT_FROM_JOB, &[]),
            ),
            SessionKind::Violation(detail) => builder.build(
                Severity::Error,
                codes::PROTOCOL_VIOLATION,
                codes::message(codes::PROTOCOL_VIOLATION, &[&detail]),
            ),
            SessionKind::Failed { message, oom } => {
                // The process was already killed; this only reaps it.
                let _ = process.wait_with_timeout(self.config.exit_timeout()).await;
                if oom {
                    builder.build(
                        Severity::Error,
                        codes::MEMORY_SIZE_TOO_SMALL,
                        codes::message(codes::MEMORY_SIZE_TOO_SMALL, &[&heap]),
                    )
                } else {
                    builder.build(
                        Severity::Error,
                        codes::SCAN_FAILED,
                        codes::message(codes::SCAN_FAILED, &[&message]),
                    )
                }
            }
            SessionKind::Completed => {
                match process.wait_with_timeout(self.config.exit_timeout()).await {
                    Some(0) => builder.build(Severity::Ok, codes::OK, "scan completed"),
                    Some(code) => {
                        let fatal_startup = first_lines.iter().any(|line| {
                            FATAL_STARTUP_PREFIXES
                                .iter()
                                .any(|prefix| line.starts_with(prefix))
                        });
                        if fatal_startup {
                            builder.build(
                                Severity::Error,
                                codes::MEMORY_SIZE_TOO_BIG,
                                codes::message(codes::MEMORY_SIZE_TOO_BIG, &[&heap]),
                            )
                        } else {
                            builder.build(
                                Severity::Error,
                                codes::PROCESS_FAILED,
                                codes::message(codes::PROCESS_FAILED, &[&code.to_string()]),
                            )
                        }
                    }
                    None => {
                        let mut builder = builder;
                        builder.add_error(
                            codes::PROCESS_FAILED,
                            "timed out waiting for the worker process to exit",
                            None,
                        );
                        builder.build(
                            Severity::Error,
                            codes::PROCESS_FAILED,
                            codes::message(codes::PROCESS_FAILED, &["unknown"]),
                        )
                    }
                }
            }
        }
    }
}

/// How the session loop ended.
enum SessionKind {
    /// Outer DONE or EOF; the exit code decides the outcome.
    Completed,
    /// A FAILED frame arrived; the worker was terminated.
    Failed { message: String, oom: bool },
    Cancelled,
    Violation(String),
    /// EOF before any banner line.
    NoOutput,
}

struct SessionState {
    job_name: String,
    fault: Option<FaultCode>,
    stack: TaskStack,
    builder: StatusBuilder,
    first_lines: Vec<String>,
    begun: bool,
    consecutive_gcs: u32,
}

impl SessionState {
    fn new(config: &LaunchConfig) -> Self {
        Self {
            job_name: config.name().to_string(),
            fault: config.fault(),
            stack: TaskStack::new(config.work()),
            builder: StatusBuilder::new(),
            first_lines: Vec::new(),
            begun: false,
            consecutive_gcs: 0,
        }
    }

    fn push_first_line(&mut self, line: &str) {
        if self.first_lines.len() < FIRST_LINES {
            self.first_lines.push(line.to_string());
        }
    }

    /// Label leaves with the innermost live scope, falling back to the job.
    fn exceptional_leaf(
        &self,
        kind: &str,
        message: &str,
        payload: &ExceptionPayload,
    ) -> (String, Option<SyntheticException>) {
        let label = self.stack.innermost_name().unwrap_or(&self.job_name);
        let text = format!("{label} {kind}: {message}");
        let cause = if payload.frames.is_empty() {
            None
        } else {
            Some(SyntheticException {
                summary: payload
                    .summary
                    .clone()
                    .unwrap_or_else(|| message.to_string()),
                frames: payload.frames.clone(),
            })
        };
        (text, cause)
    }
}

async fn send_cancel_and_kill<W, P>(sink: &mut W, process: &mut P, log: &RunLog) -> SessionKind
where
    W: Sink<Frame> + Unpin,
    P: ProcessHandle + ?Sized,
{
    log.warn("cancelling run");
    let _ = sink.send(Frame::Control(ControlFrame::Cancel)).await;
    process.kill().await;
    SessionKind::Cancelled
}

async fn violation<P>(process: &mut P, log: &RunLog, detail: String) -> SessionKind
where
    P: ProcessHandle + ?Sized,
{
    log.error(&format!("protocol violation: {detail}"));
    process.kill().await;
    SessionKind::Violation(detail)
}

fn handle_diagnostic(state: &mut SessionState, log: &RunLog, line: &str) {
    if line.starts_with("[Full GC") {
        state.consecutive_gcs += 1;
        if state.consecutive_gcs > MAX_CONSECUTIVE_GCS {
            log.warn(&format!(
                "probably low on memory: {} consecutive full GCs",
                state.consecutive_gcs
            ));
        }
    } else {
        state.consecutive_gcs = 0;
    }
    log.line(line);
}

/// The session read loop.
///
/// Owns every mutation of the task stack and the status builder; nothing
/// else touches them while the loop runs. Cancellation is checked before
/// each frame is dispatched, so once the monitor reports it, the only
/// remaining traffic is the CANCEL send.
async fn drive_session<S, W, P>(
    frames: &mut S,
    sink: &mut W,
    process: &mut P,
    monitor: &mut dyn ProgressMonitor,
    state: &mut SessionState,
    log: &RunLog,
) -> SessionKind
where
    S: Stream<Item = Result<Frame, DecodeError>> + Unpin,
    W: Sink<Frame> + Unpin,
    P: ProcessHandle + ?Sized,
{
    // Relay verbose JVM startup noise until the first real line.
    let first = loop {
        match frames.next().await {
            None => return SessionKind::NoOutput,
            Some(Err(e)) => return violation(process, log, e.to_string()).await,
            Some(Ok(Frame::Diagnostic(line))) if line.starts_with('[') => log.line(&line),
            Some(Ok(frame)) => break frame,
        }
    };
    log.line(&format!("first line = {}", first.to_line()));
    state.push_first_line(&first.to_line());

    if state.fault == Some(FaultCode::ScanCancelled) {
        return send_cancel_and_kill(sink, process, log).await;
    }

    state.stack.begin(monitor);
    state.begun = true;

    let mut pending = match first {
        Frame::Diagnostic(_) => None,
        control => Some(control),
    };

    loop {
        if monitor.is_canceled() {
            return send_cancel_and_kill(sink, process, log).await;
        }

        let frame = match pending.take() {
            Some(frame) => frame,
            None => match frames.next().await {
                None => break,
                Some(Err(e)) => return violation(process, log, e.to_string()).await,
                Some(Ok(frame)) => {
                    state.push_first_line(&frame.to_line());
                    frame
                }
            },
        };

        let wire = frame.to_line();
        match frame {
            Frame::Diagnostic(line) => handle_diagnostic(state, log, &line),
            Frame::Control(control) => {
                state.consecutive_gcs = 0;
                match control {
                    ControlFrame::Task { name, total } => {
                        log.line(&wire);
                        if let Err(v) = state.stack.on_task(&name, total, monitor) {
                            return violation(process, log, v.to_string()).await;
                        }
                    }
                    ControlFrame::SubTask { name } => {
                        log.line(&wire);
                        state.stack.on_sub_task(&name, monitor);
                    }
                    ControlFrame::SubTaskDone => {
                        log.line(&wire);
                        state.stack.on_sub_task_done(monitor);
                    }
                    ControlFrame::Work { units } => {
                        log.line(&wire);
                        state.stack.on_work(units, monitor);
                    }
                    ControlFrame::Warning { message }
                    | ControlFrame::WarningTrace { message } => {
                        let payload = match codec::read_exception_payload(frames).await {
                            Ok(payload) => payload,
                            Err(e) => return violation(process, log, e.to_string()).await,
                        };
                        let (text, cause) = state.exceptional_leaf("warning", &message, &payload);
                        log.warn(&text);
                        state.builder.add_warning(codes::OK, text, cause);
                        pending = payload.leftover;
                    }
                    ControlFrame::Failed { message } => {
                        let payload = match codec::read_exception_payload(frames).await {
                            Ok(payload) => payload,
                            Err(e) => return violation(process, log, e.to_string()).await,
                        };
                        let (text, cause) = state.exceptional_leaf("failed", &message, &payload);
                        log.error(&text);
                        let oom = text.contains("OutOfMemoryError")
                            || payload
                                .summary
                                .as_deref()
                                .is_some_and(|s| s.contains("OutOfMemoryError"));
                        state.builder.add_error(codes::OK, text.clone(), cause);
                        log.error("terminating run");
                        process.kill().await;
                        return SessionKind::Failed { message: text, oom };
                    }
                    ControlFrame::Done => {
                        log.line(&wire);
                        match state.stack.on_done(monitor) {
                            Err(v) => return violation(process, log, v.to_string()).await,
                            Ok(StackEvent::OuterDone) => break,
                            Ok(StackEvent::Continue) => {}
                        }
                    }
                    ControlFrame::Cancel => {
                        return violation(
                            process,
                            log,
                            "unexpected CANCEL from worker".to_string(),
                        )
                        .await;
                    }
                }
            }
        }
    }
    SessionKind::Completed
}
