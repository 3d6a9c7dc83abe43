//! Launch configuration for the worker process.
//!
//! Built once per invocation and immutable afterwards; the builder methods
//! consume self. The command line produced here targets a JVM analysis
//! engine, with the same settings mirrored into environment variables so a
//! non-JVM worker binary can pick them up too.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{
    FAULT_CODE_ENV, FAULT_CODE_PROPERTY, REMOTE_PORT_ENV, REMOTE_PORT_PROPERTY, RUN_DIR_ENV,
    RUN_DIR_PROPERTY,
};

const CLASSPATH_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// Deterministically forces one failure path, for exercising the
/// controller's diagnoses end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultCode {
    /// Start the worker with a 2 MB heap.
    LowMemory,
    /// Start the worker with a 2048 MB heap.
    HighMemory,
    /// Request a heap so large the JVM refuses to start.
    MadMemory,
    /// Fail classpath validation as if a required entry were missing.
    MissingRequiredFile,
    /// Worker exits before writing its banner.
    NoOutput,
    /// Controller cancels the run as soon as the banner arrives.
    ScanCancelled,
    /// Worker reports a forced FAILED frame before running the job.
    ScanFailed,
    /// Worker exits abnormally after initialization.
    AbnormalExit,
    /// Worker fails with a forced unhandled error.
    GenericException,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowMemory => "low-memory",
            Self::HighMemory => "high-memory",
            Self::MadMemory => "mad-memory",
            Self::MissingRequiredFile => "missing-required-file",
            Self::NoOutput => "no-output",
            Self::ScanCancelled => "scan-cancelled",
            Self::ScanFailed => "scan-failed",
            Self::AbnormalExit => "abnormal-exit",
            Self::GenericException => "generic-exception",
        }
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown fault code: {0:?}")]
pub struct UnknownFaultCode(pub String);

impl std::str::FromStr for FaultCode {
    type Err = UnknownFaultCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "low-memory" => Self::LowMemory,
            "high-memory" => Self::HighMemory,
            "mad-memory" => Self::MadMemory,
            "missing-required-file" => Self::MissingRequiredFile,
            "no-output" => Self::NoOutput,
            "scan-cancelled" => Self::ScanCancelled,
            "scan-failed" => Self::ScanFailed,
            "abnormal-exit" => Self::AbnormalExit,
            "generic-exception" => Self::GenericException,
            other => return Err(UnknownFaultCode(other.to_string())),
        })
    }
}

/// One classpath element; optional entries are skipped when absent.
#[derive(Debug, Clone)]
pub struct ClasspathEntry {
    pub path: PathBuf,
    pub required: bool,
}

/// Configuration errors raised before any process is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("work budget must be positive")]
    ZeroWork,
    #[error("required file {} does not exist", .0.display())]
    MissingClasspath(PathBuf),
}

/// Everything needed to launch and supervise one worker process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    name: String,
    work: u32,
    entry_point: String,
    java_exe: PathBuf,
    classpath: Vec<ClasspathEntry>,
    memory_mb: u32,
    metaspace_mb: u32,
    verbose: bool,
    fault: Option<FaultCode>,
    log_path: Option<PathBuf>,
    port: u16,
    run_dir: Option<PathBuf>,
    exit_timeout: Duration,
    accept_timeout: Duration,
}

impl LaunchConfig {
    /// `name` labels the job in diagnostics, `entry_point` is the worker's
    /// main-entry identifier, `work` is the progress budget the caller's
    /// monitor will be begun with.
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>, work: u32) -> Self {
        Self {
            name: name.into(),
            work,
            entry_point: entry_point.into(),
            java_exe: PathBuf::from("java"),
            classpath: Vec::new(),
            memory_mb: 0,
            metaspace_mb: 0,
            verbose: false,
            fault: None,
            log_path: None,
            port: 0,
            run_dir: None,
            exit_timeout: Duration::from_secs(60),
            accept_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_classpath_entry(mut self, path: impl Into<PathBuf>, required: bool) -> Self {
        self.classpath.push(ClasspathEntry {
            path: path.into(),
            required,
        });
        self
    }

    /// Add every `*.jar` directly inside `dir` as a required entry.
    pub fn with_jars_from(mut self, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jar") {
                self.classpath.push(ClasspathEntry {
                    path,
                    required: true,
                });
            }
        }
        Ok(self)
    }

    pub fn with_memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn with_metaspace_mb(mut self, mb: u32) -> Self {
        self.metaspace_mb = mb;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_fault(mut self, fault: FaultCode) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Non-zero selects socket mode, rendezvousing on this loopback port
    /// (probing upwards when it is taken). Zero uses the inherited pipes.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_java_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.java_exe = exe.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work(&self) -> u32 {
        self.work
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn fault(&self) -> Option<FaultCode> {
        self.fault
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn exit_timeout(&self) -> Duration {
        self.exit_timeout
    }

    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// The heap the worker will be started with, in MB.
    pub fn heap_mb(&self) -> u32 {
        match self.fault {
            Some(FaultCode::LowMemory) => 2,
            Some(FaultCode::HighMemory) => 2048,
            Some(FaultCode::MadMemory) => 9999,
            _ if self.memory_mb > 0 => self.memory_mb,
            _ if cfg!(target_pointer_width = "64") => 1500,
            _ => 1024,
        }
    }

    fn metaspace_mb(&self) -> u32 {
        if self.metaspace_mb > 0 {
            self.metaspace_mb
        } else if cfg!(target_pointer_width = "64") {
            256
        } else {
            128
        }
    }

    /// Check that every required classpath entry exists.
    ///
    /// The `missing-required-file` fault reports the first entry as missing
    /// regardless, so that failure path can be exercised deterministically.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work == 0 {
            return Err(ConfigError::ZeroWork);
        }
        if self.fault == Some(FaultCode::MissingRequiredFile) {
            let path = self
                .classpath
                .first()
                .map(|e| e.path.clone())
                .unwrap_or_else(|| PathBuf::from(&self.entry_point));
            return Err(ConfigError::MissingClasspath(path));
        }
        for entry in &self.classpath {
            if entry.required && !entry.path.exists() {
                return Err(ConfigError::MissingClasspath(entry.path.clone()));
            }
        }
        Ok(())
    }

    /// Build the worker command line for an already-resolved rendezvous
    /// port (zero in pipe mode).
    pub fn launch_plan(&self, port: u16) -> LaunchPlan {
        let mut args = Vec::new();
        let mut env = Vec::new();

        args.push(format!("-Xmx{}m", self.heap_mb()));
        args.push(format!("-XX:MaxMetaspaceSize={}m", self.metaspace_mb()));
        if cfg!(target_pointer_width = "64") {
            args.push("-XX:+UseCompressedOops".to_string());
        }
        if let Some(fault) = self.fault {
            args.push(format!("-D{FAULT_CODE_PROPERTY}={fault}"));
            env.push((FAULT_CODE_ENV.to_string(), fault.to_string()));
        }
        if port != 0 {
            args.push(format!("-D{REMOTE_PORT_PROPERTY}={port}"));
            env.push((REMOTE_PORT_ENV.to_string(), port.to_string()));
        }
        if let Some(run_dir) = &self.run_dir {
            args.push(format!("-D{RUN_DIR_PROPERTY}={}", run_dir.display()));
            env.push((RUN_DIR_ENV.to_string(), run_dir.display().to_string()));
        }

        let existing: Vec<String> = self
            .classpath
            .iter()
            .filter(|e| e.path.exists())
            .map(|e| e.path.display().to_string())
            .collect();
        if !existing.is_empty() {
            args.push("-cp".to_string());
            args.push(existing.join(&CLASSPATH_SEPARATOR.to_string()));
        }
        args.push(self.entry_point.clone());

        LaunchPlan {
            program: self.java_exe.clone(),
            args,
            env,
        }
    }
}

/// The resolved command line handed to the transport.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Single-line rendering for the run log.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}
