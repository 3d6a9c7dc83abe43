//! scanlet: out-of-process execution engine for static-analysis scans.

pub mod bridge;
pub mod codes;
pub mod config;
pub mod launcher;
pub mod progress;
mod runlog;
pub mod status;
pub mod worker;
mod worker_log_layer;

pub use config::{ClasspathEntry, FaultCode, LaunchConfig, LaunchPlan};
pub use launcher::{LaunchError, Launcher};
pub use progress::ProgressMonitor;
pub use status::{Severity, StatusBuilder, StatusNode, SyntheticException, SyntheticFrame};
pub use worker::{
    JobFactory, ScanJob, WorkerEnv, WorkerMonitor, WorkerOptions, run_worker, worker_main,
};
pub use worker_log_layer::WorkerLogLayer;
