//! Per-run diagnostic log: tracing plus an optional tee into a log file.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Sink for the controller's diagnostic output.
///
/// Protocol lines and worker chatter go through [`RunLog::line`], which only
/// reaches tracing at debug level unless verbose is set; warnings and errors
/// always surface. When a log path was configured, everything is also
/// appended to that file, as the host's support tooling expects.
pub(crate) struct RunLog {
    verbose: bool,
    file: Option<Mutex<File>>,
}

impl RunLog {
    pub(crate) fn open(verbose: bool, path: Option<&Path>) -> Self {
        let file = path.and_then(|p| match File::create(p) {
            Ok(f) => {
                tracing::debug!(path = %p.display(), "created run log file");
                Some(Mutex::new(f))
            }
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "could not create run log file");
                None
            }
        });
        Self { verbose, file }
    }

    pub(crate) fn line(&self, msg: &str) {
        if self.verbose {
            tracing::info!(target: "scanlet::run", "{msg}");
        } else {
            tracing::debug!(target: "scanlet::run", "{msg}");
        }
        self.tee(msg);
    }

    pub(crate) fn warn(&self, msg: &str) {
        tracing::warn!(target: "scanlet::run", "{msg}");
        self.tee(msg);
    }

    pub(crate) fn error(&self, msg: &str) {
        tracing::error!(target: "scanlet::run", "{msg}");
        self.tee(msg);
    }

    fn tee(&self, msg: &str) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writeln!(file, "{msg}");
        }
    }
}
