//! Worker process entry point.
//!
//! This is the child's side of the protocol. The parent side (spawning,
//! frame routing, status aggregation) lives in `launcher`. The worker
//! connects its transport, builds the actual job through an injected
//! factory, runs it while emitting frames through a [`WorkerMonitor`], and
//! exits with one of the shared category codes.
//!
//! Cancellation is cooperative. A background task watches the inbound
//! stream and trips a token when `##CANCEL` arrives; the job only observes
//! that at defined checkpoints, never as an interrupt.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{
    ControlFrame, FAULT_CODE_ENV, Frame, REMOTE_PORT_ENV, RUN_DIR_ENV, exit,
};
use crate::config::FaultCode;
use crate::status::{Severity, StatusNode, SyntheticException};
use crate::worker_log_layer::WorkerLogLayer;

/// Launch settings the worker reads back out of its environment.
#[derive(Debug, Clone, Default)]
pub struct WorkerEnv {
    pub fault: Option<FaultCode>,
    /// Non-zero means connect back to the controller on this loopback port.
    pub port: u16,
    pub run_dir: Option<PathBuf>,
}

impl WorkerEnv {
    pub fn from_env() -> Self {
        let fault = std::env::var(FAULT_CODE_ENV).ok().and_then(|raw| {
            raw.parse::<FaultCode>()
                .map_err(|e| tracing::warn!(error = %e, "ignoring fault code"))
                .ok()
        });
        let port = std::env::var(REMOTE_PORT_ENV)
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(0);
        let run_dir = std::env::var(RUN_DIR_ENV).ok().map(PathBuf::from);
        Self {
            fault,
            port,
            run_dir,
        }
    }
}

/// The actual analysis job the worker runs.
#[async_trait::async_trait]
pub trait ScanJob: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion, reporting progress through the monitor. The
    /// returned tree's non-Ok leaves are marshalled back to the controller.
    ///
    /// Leave the scope opened by [`WorkerMonitor::begin`] open on return;
    /// the worker closes it after the final status walk, so late warnings
    /// reach the controller before the session-ending DONE.
    async fn run(&self, monitor: &WorkerMonitor) -> anyhow::Result<StatusNode>;
}

/// Builds the job once the worker process is up.
#[async_trait::async_trait]
pub trait JobFactory: Send + Sync {
    async fn init(&self, env: &WorkerEnv, monitor: &WorkerMonitor)
    -> anyhow::Result<Box<dyn ScanJob>>;
}

/// Progress monitor that encodes every call as a protocol frame.
///
/// `is_canceled` reflects only what a checkpoint has already observed; it
/// never blocks and never races ahead of the job's own sampling points.
#[derive(Clone)]
pub struct WorkerMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    tx: mpsc::UnboundedSender<Frame>,
    token: CancellationToken,
    observed_cancel: AtomicBool,
    open_scopes: std::sync::atomic::AtomicU32,
}

impl WorkerMonitor {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Frame>, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                tx,
                token,
                observed_cancel: AtomicBool::new(false),
                open_scopes: std::sync::atomic::AtomicU32::new(0),
            }),
        }
    }

    fn send(&self, frame: Frame) {
        let _ = self.inner.tx.send(frame);
    }

    fn control(&self, frame: ControlFrame) {
        self.send(Frame::Control(frame));
    }

    /// Open a named task scope declaring its total work.
    pub fn task(&self, name: &str, total: u32) {
        self.inner.open_scopes.fetch_add(1, Ordering::Relaxed);
        self.control(ControlFrame::Task {
            name: name.to_string(),
            total,
        });
    }

    /// Open the conventional top-level scope.
    pub fn begin(&self, total: u32) {
        self.task("Scan", total);
    }

    pub fn done(&self) {
        let _ = self
            .inner
            .open_scopes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
        self.control(ControlFrame::Done);
    }

    /// Close whatever scopes the job left open, innermost first.
    pub(crate) fn close_open_scopes(&self) {
        while self.inner.open_scopes.load(Ordering::Relaxed) > 0 {
            self.done();
        }
    }

    pub fn sub_task(&self, name: &str) {
        self.control(ControlFrame::SubTask {
            name: name.to_string(),
        });
        self.checkpoint();
    }

    pub fn sub_task_done(&self) {
        self.control(ControlFrame::SubTaskDone);
        self.checkpoint();
    }

    pub fn worked(&self, units: u32) {
        self.control(ControlFrame::Work { units });
        self.checkpoint();
    }

    /// Report a warning with no stack trace.
    pub fn error(&self, message: &str) {
        self.control(ControlFrame::Warning {
            message: message.to_string(),
        });
        self.send(Frame::diagnostic(message));
    }

    /// Report a warning carrying a reconstructed stack trace.
    pub fn error_with(&self, message: &str, cause: &SyntheticException) {
        self.control(ControlFrame::WarningTrace {
            message: message.to_string(),
        });
        self.emit_payload(message, Some(cause));
    }

    /// Report a fatal failure. This ends the session on the controller
    /// side, so the cancelled flag is tripped too to stop the job.
    pub fn failed(&self, message: &str, cause: Option<&SyntheticException>) {
        self.inner.observed_cancel.store(true, Ordering::Relaxed);
        self.control(ControlFrame::Failed {
            message: message.to_string(),
        });
        self.emit_payload(message, cause);
    }

    fn emit_payload(&self, message: &str, cause: Option<&SyntheticException>) {
        match cause {
            Some(cause) => {
                self.send(Frame::diagnostic(cause.summary.clone()));
                for frame in &cause.frames {
                    self.send(Frame::diagnostic(format!("\tat {frame}")));
                }
            }
            None => self.send(Frame::diagnostic(message)),
        }
    }

    /// Emit a plain diagnostic line.
    pub fn diagnostic(&self, line: &str) {
        self.send(Frame::diagnostic(line));
    }

    /// Sample the cancel token; the only way `is_canceled` ever flips.
    pub fn checkpoint(&self) {
        if self.inner.token.is_cancelled() {
            self.inner.observed_cancel.store(true, Ordering::Relaxed);
        }
    }

    fn checkpoint_line(&self, line: &str) {
        self.diagnostic(line);
        self.checkpoint();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.observed_cancel.load(Ordering::Relaxed)
    }
}

/// Hook for wiring a log-forwarding subscriber once the monitor exists;
/// returns the cleanup to run after the job finishes.
pub type LogHook = Box<dyn FnOnce(&WorkerMonitor) -> Box<dyn FnOnce() + Send> + Send>;

#[derive(Default)]
pub struct WorkerOptions {
    pub log_hook: Option<LogHook>,
}

/// Run the worker side over arbitrary streams and return the exit code.
///
/// `worker_main` wraps this for a real process; tests drive it over an
/// in-memory duplex.
pub async fn run_worker<F, R, W>(
    factory: Arc<F>,
    env: &WorkerEnv,
    reader: R,
    writer: W,
    options: WorkerOptions,
) -> i32
where
    F: JobFactory + ?Sized,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if env.fault == Some(FaultCode::NoOutput) {
        return exit::NO_OUTPUT;
    }

    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let quit = CancellationToken::new();
    let forwarder = tokio::spawn(forward_frames(rx, writer, quit.clone()));

    let token = CancellationToken::new();
    let listener = tokio::spawn(cancel_listener(reader, token.clone(), tx.clone()));

    let monitor = WorkerMonitor::new(tx, token);
    monitor.diagnostic(&format!(
        "scan worker started: scanlet {}",
        env!("CARGO_PKG_VERSION")
    ));

    let cleanup = options.log_hook.map(|hook| hook(&monitor));
    let code = run_job(factory.as_ref(), env, &monitor).await;
    if let Some(cleanup) = cleanup {
        cleanup();
    }

    quit.cancel();
    let _ = forwarder.await;
    listener.abort();
    let _ = listener.await;
    code
}

async fn run_job<F>(factory: &F, env: &WorkerEnv, monitor: &WorkerMonitor) -> i32
where
    F: JobFactory + ?Sized,
{
    monitor.checkpoint_line("created monitor");

    let job = match factory.init(env, monitor).await {
        Ok(job) => job,
        Err(e) => {
            monitor.failed(&format!("scan job initialization failed: {e:#}"), None);
            return exit::INIT_FAILED;
        }
    };
    monitor.checkpoint_line("initialized job");

    match env.fault {
        Some(FaultCode::ScanFailed) => monitor.failed("forced scan failure", None),
        Some(FaultCode::AbnormalExit) => return exit::PROCESS_FAILED,
        Some(FaultCode::GenericException) => {
            monitor.failed("forced scan exception", None);
            return exit::JOB_FAILED;
        }
        _ => {}
    }

    let started = Instant::now();
    let status = match job.run(monitor).await {
        Ok(status) => status,
        Err(e) => {
            monitor.failed(&format!("{e:#}"), None);
            return exit::JOB_FAILED;
        }
    };
    report_leaves(&status, monitor);
    monitor.checkpoint_line(&format!(
        "scan complete ({} ms)",
        started.elapsed().as_millis()
    ));
    monitor.close_open_scopes();

    if monitor.is_canceled() {
        return exit::CANCELLED;
    }
    exit::OK
}

/// Marshal the non-Ok leaves of the job's status tree back as frames.
fn report_leaves(status: &StatusNode, monitor: &WorkerMonitor) {
    status.for_each_leaf(&mut |leaf| {
        if leaf.severity == Severity::Ok {
            return;
        }
        match &leaf.cause {
            Some(cause) => monitor.error_with(&leaf.message, cause),
            None => monitor.error(&leaf.message),
        }
    });
}

async fn forward_frames<W>(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    writer: W,
    quit: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(writer, FrameCodec::new());
    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => match frame {
                Some(frame) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            _ = quit.cancelled() => {
                // Stop accepting new frames but drain what is queued.
                rx.close();
                while let Some(frame) = rx.recv().await {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
}

/// Watch the inbound stream for `##CANCEL`, echoing whatever arrives.
async fn cancel_listener<R>(reader: R, token: CancellationToken, tx: mpsc::UnboundedSender<Frame>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new());
    while let Some(item) = frames.next().await {
        match item {
            Ok(frame) => {
                let _ = tx.send(Frame::diagnostic(format!("received: {}", frame.to_line())));
                if frame == Frame::Control(ControlFrame::Cancel) {
                    token.cancel();
                }
            }
            Err(_) => break,
        }
    }
}

/// Process entry point: connect the transport named by the environment,
/// install the log-forwarding layer, run, and exit.
pub async fn worker_main(factory: Arc<dyn JobFactory>) -> ! {
    let env = WorkerEnv::from_env();

    let hook: LogHook = Box::new(|monitor: &WorkerMonitor| {
        use tracing_subscriber::layer::SubscriberExt;
        let subscriber =
            tracing_subscriber::registry().with(WorkerLogLayer::new(monitor.clone()));
        let _ = tracing::subscriber::set_global_default(subscriber);
        Box::new(|| {}) as Box<dyn FnOnce() + Send>
    });
    let options = WorkerOptions {
        log_hook: Some(hook),
    };

    let code = if env.port != 0 {
        match tokio::net::TcpStream::connect(("127.0.0.1", env.port)).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                run_worker(factory, &env, reader, writer, options).await
            }
            Err(e) => {
                eprintln!("could not connect back to controller: {e}");
                exit::PROCESS_FAILED
            }
        }
    } else {
        run_worker(factory, &env, tokio::io::stdin(), tokio::io::stdout(), options).await
    };
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DecodeError;
    use tokio::io::AsyncWriteExt;

    struct FixedJob {
        status: StatusNode,
        emit_progress: bool,
    }

    #[async_trait::async_trait]
    impl ScanJob for FixedJob {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(&self, monitor: &WorkerMonitor) -> anyhow::Result<StatusNode> {
            if self.emit_progress {
                monitor.begin(10);
                monitor.sub_task("walking sources");
                monitor.worked(10);
                monitor.sub_task_done();
            }
            Ok(self.status.clone())
        }
    }

    struct FixedFactory {
        status: StatusNode,
        emit_progress: bool,
    }

    #[async_trait::async_trait]
    impl JobFactory for FixedFactory {
        async fn init(
            &self,
            _env: &WorkerEnv,
            _monitor: &WorkerMonitor,
        ) -> anyhow::Result<Box<dyn ScanJob>> {
            Ok(Box::new(FixedJob {
                status: self.status.clone(),
                emit_progress: self.emit_progress,
            }))
        }
    }

    struct FailingFactory;

    #[async_trait::async_trait]
    impl JobFactory for FailingFactory {
        async fn init(
            &self,
            _env: &WorkerEnv,
            _monitor: &WorkerMonitor,
        ) -> anyhow::Result<Box<dyn ScanJob>> {
            anyhow::bail!("missing rule pack")
        }
    }

    async fn run_with(
        factory: Arc<dyn JobFactory>,
        env: WorkerEnv,
    ) -> (i32, Vec<Frame>) {
        let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let worker = tokio::spawn(async move {
            run_worker(factory, &env, worker_read, worker_write, WorkerOptions::default()).await
        });

        let (mut controller_read, controller_write) = tokio::io::split(controller_io);
        let code = worker.await.unwrap();
        drop(controller_write);

        let mut framed = FramedRead::new(&mut controller_read, FrameCodec::new());
        let mut frames = Vec::new();
        while let Some(item) = framed.next().await {
            match item {
                Ok(frame) => frames.push(frame),
                Err(DecodeError::Io(_)) => break,
                Err(e) => panic!("decode error: {e}"),
            }
        }
        (code, frames)
    }

    fn controls(frames: &[Frame]) -> Vec<ControlFrame> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Control(c) => Some(c.clone()),
                Frame::Diagnostic(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn clean_run_emits_banner_progress_and_exits_zero() {
        let factory = Arc::new(FixedFactory {
            status: StatusNode::ok("scan finished"),
            emit_progress: true,
        });
        let (code, frames) = run_with(factory, WorkerEnv::default()).await;

        assert_eq!(code, exit::OK);
        assert!(matches!(
            &frames[0],
            Frame::Diagnostic(line) if line.starts_with("scan worker started: scanlet")
        ));
        assert_eq!(
            controls(&frames),
            vec![
                ControlFrame::Task {
                    name: "Scan".to_string(),
                    total: 10,
                },
                ControlFrame::SubTask {
                    name: "walking sources".to_string(),
                },
                ControlFrame::Work { units: 10 },
                ControlFrame::SubTaskDone,
                ControlFrame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn non_ok_leaves_are_marshalled_as_warnings() {
        let status = StatusNode::ok("scan finished")
            .with_child(StatusNode::warning(0, "dusty rule", None))
            .with_child(StatusNode::error(
                0,
                "engine hiccup",
                Some(SyntheticException {
                    summary: "java.lang.IllegalStateException : hiccup".to_string(),
                    frames: vec![],
                }),
            ));
        let factory = Arc::new(FixedFactory {
            status,
            emit_progress: false,
        });
        let (code, frames) = run_with(factory, WorkerEnv::default()).await;

        assert_eq!(code, exit::OK);
        let controls = controls(&frames);
        assert!(controls.contains(&ControlFrame::Warning {
            message: "dusty rule".to_string(),
        }));
        assert!(controls.contains(&ControlFrame::WarningTrace {
            message: "engine hiccup".to_string(),
        }));
    }

    #[tokio::test]
    async fn init_failure_reports_failed_and_exits_with_init_code() {
        let (code, frames) = run_with(Arc::new(FailingFactory), WorkerEnv::default()).await;

        assert_eq!(code, exit::INIT_FAILED);
        assert!(controls(&frames).iter().any(|c| matches!(
            c,
            ControlFrame::Failed { message } if message.contains("missing rule pack")
        )));
    }

    #[tokio::test]
    async fn no_output_fault_exits_silently() {
        let factory = Arc::new(FixedFactory {
            status: StatusNode::ok("unused"),
            emit_progress: false,
        });
        let env = WorkerEnv {
            fault: Some(FaultCode::NoOutput),
            ..WorkerEnv::default()
        };
        let (code, frames) = run_with(factory, env).await;

        assert_eq!(code, exit::NO_OUTPUT);
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn abnormal_exit_fault_uses_the_process_code() {
        let factory = Arc::new(FixedFactory {
            status: StatusNode::ok("unused"),
            emit_progress: false,
        });
        let env = WorkerEnv {
            fault: Some(FaultCode::AbnormalExit),
            ..WorkerEnv::default()
        };
        let (code, _frames) = run_with(factory, env).await;
        assert_eq!(code, exit::PROCESS_FAILED);
    }

    #[tokio::test]
    async fn scan_failed_fault_emits_a_failed_frame_but_still_runs() {
        let factory = Arc::new(FixedFactory {
            status: StatusNode::ok("unused"),
            emit_progress: false,
        });
        let env = WorkerEnv {
            fault: Some(FaultCode::ScanFailed),
            ..WorkerEnv::default()
        };
        let (code, frames) = run_with(factory, env).await;

        // The forced failure trips the cancelled flag, so the worker exits
        // with the cancellation code after the job returns.
        assert_eq!(code, exit::CANCELLED);
        assert!(controls(&frames).contains(&ControlFrame::Failed {
            message: "forced scan failure".to_string(),
        }));
    }

    #[tokio::test]
    async fn cancel_line_is_observed_at_the_next_checkpoint() {
        struct CancelAwareJob;

        #[async_trait::async_trait]
        impl ScanJob for CancelAwareJob {
            fn name(&self) -> &str {
                "cancel-aware"
            }

            async fn run(&self, monitor: &WorkerMonitor) -> anyhow::Result<StatusNode> {
                monitor.begin(100);
                for _ in 0..200 {
                    if monitor.is_canceled() {
                        return Ok(StatusNode::cancel(
                            crate::codes::JOB_CANCELLED,
                            "stopped at checkpoint",
                        ));
                    }
                    monitor.worked(1);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                Ok(StatusNode::ok("ran to completion"))
            }
        }

        struct CancelAwareFactory;

        #[async_trait::async_trait]
        impl JobFactory for CancelAwareFactory {
            async fn init(
                &self,
                _env: &WorkerEnv,
                _monitor: &WorkerMonitor,
            ) -> anyhow::Result<Box<dyn ScanJob>> {
                Ok(Box::new(CancelAwareJob))
            }
        }

        let (controller_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        let env = WorkerEnv::default();

        let worker = tokio::spawn(async move {
            run_worker(
                Arc::new(CancelAwareFactory),
                &env,
                worker_read,
                worker_write,
                WorkerOptions::default(),
            )
            .await
        });

        let (controller_read, mut controller_write) = tokio::io::split(controller_io);
        controller_write.write_all(b"##CANCEL\n").await.unwrap();
        controller_write.flush().await.unwrap();

        let code = worker.await.unwrap();
        assert_eq!(code, exit::CANCELLED);
        drop(controller_read);
    }

    #[test]
    fn worker_env_reads_launch_properties() {
        // Serialized access to the process environment; this is the only
        // test touching these variables.
        unsafe {
            std::env::set_var(FAULT_CODE_ENV, "scan-failed");
            std::env::set_var(REMOTE_PORT_ENV, "45001");
            std::env::set_var(RUN_DIR_ENV, "/tmp/scan-run");
        }
        let env = WorkerEnv::from_env();
        unsafe {
            std::env::remove_var(FAULT_CODE_ENV);
            std::env::remove_var(REMOTE_PORT_ENV);
            std::env::remove_var(RUN_DIR_ENV);
        }

        assert_eq!(env.fault, Some(FaultCode::ScanFailed));
        assert_eq!(env.port, 45001);
        assert_eq!(env.run_dir, Some(PathBuf::from("/tmp/scan-run")));
    }
}
