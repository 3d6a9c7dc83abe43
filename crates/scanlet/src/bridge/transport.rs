//! Process transport between controller and worker.
//!
//! Pipe mode reads the protocol off the child's merged stdout/stderr and
//! writes to its stdin. Socket mode binds a loopback listener before the
//! child is spawned, hands the port over on the command line, and carries
//! the protocol on the accepted connection while a relay task drains the
//! child's raw output for diagnostics.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::bridge::codec::{DecodeError, FrameCodec};
use crate::bridge::protocol::Frame;
use crate::config::LaunchPlan;
use crate::runlog::RunLog;

/// How many successor ports to probe when the configured one is taken.
const PORT_PROBE_RANGE: u16 = 100;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, DecodeError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = DecodeError> + Send>>;

/// Failures to get a worker process up with an open stream.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} stream was not captured")]
    MissingStdio(&'static str),
    #[error("no free console port between {base} and {last}")]
    NoPort { base: u16, last: u16 },
    #[error("timed out waiting for the worker to connect back")]
    AcceptTimeout,
}

/// Kill and bounded-wait access to the worker process.
///
/// The session loop only ever needs these two operations, which keeps it
/// testable against a stub.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn kill(&mut self);

    /// Wait for the process to exit. `None` means the wait itself timed out
    /// or failed; the exit code is `-1` when the process died to a signal.
    async fn wait_with_timeout(&mut self, timeout: Duration) -> Option<i32>;
}

pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "worker process already gone on kill");
        }
    }

    async fn wait_with_timeout(&mut self, timeout: Duration) -> Option<i32> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status.code().unwrap_or(-1)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for worker process");
                None
            }
            Err(_) => {
                tracing::warn!(?timeout, "timed out waiting for worker process to exit");
                None
            }
        }
    }
}

/// The controller's side of a running worker.
pub struct WorkerTransport {
    pub frames: FrameStream,
    pub sink: FrameSink,
    pub process: ChildProcess,
    /// Socket mode only: the task draining raw child output.
    pub relay: Option<JoinHandle<()>>,
}

fn command_for(plan: &LaunchPlan) -> Command {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn the worker and speak the protocol over its inherited pipes.
pub(crate) async fn spawn_pipe(plan: &LaunchPlan) -> Result<WorkerTransport, SpawnError> {
    let mut child = command_for(plan).spawn()?;
    let stdin = child.stdin.take().ok_or(SpawnError::MissingStdio("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingStdio("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::MissingStdio("stderr"))?;

    let out = FramedRead::new(stdout, FrameCodec::new());
    let err = FramedRead::new(stderr, FrameCodec::new());
    Ok(WorkerTransport {
        frames: Box::pin(futures::stream::select(out, err)),
        sink: Box::pin(FramedWrite::new(stdin, FrameCodec::new())),
        process: ChildProcess { child },
        relay: None,
    })
}

/// A bound loopback listener the worker will connect back to.
pub(crate) struct ConsolePort {
    listener: TcpListener,
    pub(crate) port: u16,
}

/// Bind the console listener, probing successor ports when the requested
/// one is taken. A base of zero takes any free port.
pub(crate) async fn bind_console(base: u16) -> Result<ConsolePort, SpawnError> {
    let mut last = base;
    for offset in 0..=PORT_PROBE_RANGE {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        last = port;
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                tracing::debug!(port, "console listening");
                return Ok(ConsolePort { listener, port });
            }
            Err(_) if base != 0 => continue,
            Err(e) => return Err(SpawnError::Spawn(e)),
        }
    }
    Err(SpawnError::NoPort { base, last })
}

/// Spawn the worker and speak the protocol over the rendezvous socket.
pub(crate) async fn spawn_socket(
    plan: &LaunchPlan,
    console: ConsolePort,
    accept_timeout: Duration,
    log: Arc<RunLog>,
) -> Result<WorkerTransport, SpawnError> {
    let mut child = command_for(plan).stdin(Stdio::null()).spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingStdio("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::MissingStdio("stderr"))?;
    let relay = tokio::spawn(relay_child_output(stdout, stderr, log));

    let accepted = tokio::time::timeout(accept_timeout, console.listener.accept()).await;
    let (stream, peer) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(SpawnError::Spawn(e));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(SpawnError::AcceptTimeout);
        }
    };
    tracing::debug!(%peer, "worker connected to console");

    let (read_half, write_half) = stream.into_split();
    Ok(WorkerTransport {
        frames: Box::pin(FramedRead::new(read_half, FrameCodec::new())),
        sink: Box::pin(FramedWrite::new(write_half, FrameCodec::new())),
        process: ChildProcess { child },
        relay: Some(relay),
    })
}

/// Socket mode: the child's own stdout/stderr carry no protocol, only
/// noise worth keeping in the run log.
async fn relay_child_output(stdout: ChildStdout, stderr: ChildStderr, log: Arc<RunLog>) {
    let out = FramedRead::new(stdout, LinesCodec::new());
    let err = FramedRead::new(stderr, LinesCodec::new());
    let mut merged = futures::stream::select(out, err);
    while let Some(item) = merged.next().await {
        match item {
            Ok(line) => log.line(&line),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ControlFrame;
    use std::path::PathBuf;

    fn shell_plan(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pipe_mode_merges_stdout_and_stderr() {
        let plan = shell_plan("echo '##DONE'; echo 'stderr noise' 1>&2");
        let mut transport = spawn_pipe(&plan).await.unwrap();

        let mut frames = Vec::new();
        while let Some(item) = transport.frames.next().await {
            frames.push(item.unwrap());
        }

        assert!(frames.contains(&Frame::Control(ControlFrame::Done)));
        assert!(frames.contains(&Frame::diagnostic("stderr noise")));

        let code = transport
            .process
            .wait_with_timeout(Duration::from_secs(5))
            .await;
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn pipe_mode_reports_exit_codes() {
        let plan = shell_plan("exit 3");
        let mut transport = spawn_pipe(&plan).await.unwrap();
        while transport.frames.next().await.is_some() {}
        let code = transport
            .process
            .wait_with_timeout(Duration::from_secs(5))
            .await;
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn kill_is_idempotent_on_a_dead_process() {
        let plan = shell_plan("exit 0");
        let mut transport = spawn_pipe(&plan).await.unwrap();
        while transport.frames.next().await.is_some() {}
        transport.process.kill().await;
        transport.process.kill().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_a_launch_error() {
        let plan = LaunchPlan {
            program: PathBuf::from("/definitely/not/a/program"),
            args: Vec::new(),
            env: Vec::new(),
        };
        assert!(matches!(
            spawn_pipe(&plan).await,
            Err(SpawnError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn console_probes_past_a_taken_port() {
        let first = bind_console(0).await.unwrap();
        let second = bind_console(first.port).await.unwrap();
        assert_ne!(second.port, first.port);
    }

    #[tokio::test]
    async fn socket_mode_carries_the_protocol() {
        let console = bind_console(0).await.unwrap();
        let port = console.port;

        let client = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            stream.write_all(b"##WORK, 2\n").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let log = Arc::new(RunLog::open(false, None));
        let plan = shell_plan("sleep 0.05");
        let mut transport = spawn_socket(&plan, console, Duration::from_secs(5), log)
            .await
            .unwrap();

        let frame = transport.frames.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Control(ControlFrame::Work { units: 2 }));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn socket_accept_times_out_without_a_client() {
        let console = bind_console(0).await.unwrap();
        let log = Arc::new(RunLog::open(false, None));
        let plan = shell_plan("sleep 5");
        let result = spawn_socket(&plan, console, Duration::from_millis(50), log).await;
        assert!(matches!(result, Err(SpawnError::AcceptTimeout)));
    }
}
