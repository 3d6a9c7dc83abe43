//! Wire frame model for controller-worker communication.
//!
//! The protocol is UTF-8 text, one line per frame. A control frame is
//! `##OPCODE` optionally followed by comma-separated arguments; any other
//! line is a diagnostic that gets logged but carries no protocol meaning.
//! WARNING, WARNING_TRACE and FAILED frames are followed by an exception
//! payload: one type-and-message line, then tab-indented stack-frame lines,
//! terminated by the first non-indented line.

/// Launch property carrying the fault-injection code, with the matching
/// environment variable for workers that are not JVMs.
pub const FAULT_CODE_PROPERTY: &str = "scanlet.fault.code";
pub const FAULT_CODE_ENV: &str = "SCANLET_FAULT_CODE";

/// Launch property carrying the rendezvous port in socket mode.
pub const REMOTE_PORT_PROPERTY: &str = "scanlet.remote.port";
pub const REMOTE_PORT_ENV: &str = "SCANLET_REMOTE_PORT";

/// Launch property carrying the scan's working directory.
pub const RUN_DIR_PROPERTY: &str = "scanlet.run.dir";
pub const RUN_DIR_ENV: &str = "SCANLET_RUN_DIR";

/// Worker exit codes, mirrored on both sides of the protocol.
pub mod exit {
    pub const OK: i32 = 0;
    /// The job factory failed to produce a runnable job.
    pub const INIT_FAILED: i32 = -2;
    /// The worker observed a cancel request and stopped cooperatively.
    pub const CANCELLED: i32 = -3;
    /// The job ran and ended with an unhandled error.
    pub const JOB_FAILED: i32 = -4;
    /// Forced by the `no-output` fault before the banner is written.
    pub const NO_OUTPUT: i32 = -5;
    /// Abnormal termination, also forced by the `abnormal-exit` fault.
    pub const PROCESS_FAILED: i32 = -6;
}

/// A decoded control frame.
///
/// All variants except [`ControlFrame::Cancel`] flow worker to controller;
/// `Cancel` is the single frame flowing the other way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Opens a nested task scope declaring its total work units.
    Task { name: String, total: u32 },
    SubTask { name: String },
    SubTaskDone,
    /// Units completed against the innermost open scope.
    Work { units: u32 },
    Warning { message: String },
    WarningTrace { message: String },
    /// Ends the session; the controller terminates the worker on receipt.
    Failed { message: String },
    /// Closes the innermost open scope.
    Done,
    Cancel,
}

impl ControlFrame {
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::Task { .. } => "TASK",
            Self::SubTask { .. } => "SUBTASK",
            Self::SubTaskDone => "SUBTASK_DONE",
            Self::Work { .. } => "WORK",
            Self::Warning { .. } => "WARNING",
            Self::WarningTrace { .. } => "WARNING_TRACE",
            Self::Failed { .. } => "FAILED",
            Self::Done => "DONE",
            Self::Cancel => "CANCEL",
        }
    }
}

/// One line of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Diagnostic(String),
}

impl Frame {
    pub fn diagnostic(line: impl Into<String>) -> Self {
        Self::Diagnostic(line.into())
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// The line this frame occupies on the wire.
    pub fn to_line(&self) -> String {
        match self {
            Self::Diagnostic(line) => line.clone(),
            Self::Control(frame) => match frame {
                ControlFrame::Task { name, total } => format!("##TASK, {name}, {total}"),
                ControlFrame::SubTask { name } => format!("##SUBTASK, {name}"),
                ControlFrame::SubTaskDone => "##SUBTASK_DONE".to_string(),
                ControlFrame::Work { units } => format!("##WORK, {units}"),
                ControlFrame::Warning { message } => format!("##WARNING, {message}"),
                ControlFrame::WarningTrace { message } => format!("##WARNING_TRACE, {message}"),
                ControlFrame::Failed { message } => format!("##FAILED, {message}"),
                ControlFrame::Done => "##DONE".to_string(),
                ControlFrame::Cancel => "##CANCEL".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_frame_encodes() {
        let frame = Frame::Control(ControlFrame::Task {
            name: "Scan".to_string(),
            total: 100,
        });
        insta::assert_snapshot!(frame.to_line(), @"##TASK, Scan, 100");
    }

    #[test]
    fn work_frame_encodes() {
        let frame = Frame::Control(ControlFrame::Work { units: 7 });
        insta::assert_snapshot!(frame.to_line(), @"##WORK, 7");
    }

    #[test]
    fn bare_opcodes_encode() {
        insta::assert_snapshot!(Frame::Control(ControlFrame::Done).to_line(), @"##DONE");
        insta::assert_snapshot!(Frame::Control(ControlFrame::Cancel).to_line(), @"##CANCEL");
        insta::assert_snapshot!(
            Frame::Control(ControlFrame::SubTaskDone).to_line(),
            @"##SUBTASK_DONE"
        );
    }

    #[test]
    fn failed_frame_keeps_message_verbatim() {
        let frame = Frame::Control(ControlFrame::Failed {
            message: "java.lang.OutOfMemoryError : Java heap space".to_string(),
        });
        insta::assert_snapshot!(
            frame.to_line(),
            @"##FAILED, java.lang.OutOfMemoryError : Java heap space"
        );
    }

    #[test]
    fn diagnostic_passes_through() {
        let frame = Frame::diagnostic("plain tool chatter");
        assert_eq!(frame.to_line(), "plain tool chatter");
        assert!(!frame.is_control());
    }
}
