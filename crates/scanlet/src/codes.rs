//! Numeric diagnosis codes and their fallback message templates.
//!
//! The controller's host environment keys user-facing text off these codes;
//! the strings rendered here are the library's own fallback catalog.

pub const OK: i32 = 0;
pub const JOB_CANCELLED: i32 = 5004;
pub const MISSING_FOR_JOB: i32 = 5006;
pub const NO_OUTPUT_FROM_JOB: i32 = 5010;
pub const PROCESS_FAILED: i32 = 5011;
pub const MEMORY_SIZE_TOO_SMALL: i32 = 5012;
pub const MEMORY_SIZE_TOO_BIG: i32 = 5013;
pub const PROTOCOL_VIOLATION: i32 = 5014;
pub const SCAN_FAILED: i32 = 5015;

/// Render the fallback message for a diagnosis code.
///
/// Missing arguments render as `?` rather than panicking; codes outside the
/// catalog get a generic numbered message.
pub fn message(code: i32, args: &[&str]) -> String {
    let arg = |i: usize| args.get(i).copied().unwrap_or("?");
    match code {
        JOB_CANCELLED => "the scan was cancelled".to_string(),
        MISSING_FOR_JOB => format!("required file {} does not exist", arg(0)),
        NO_OUTPUT_FROM_JOB => "no output received from the worker process".to_string(),
        PROCESS_FAILED => format!("worker process exited with code {}", arg(0)),
        MEMORY_SIZE_TOO_SMALL => format!(
            "requested memory size of {} MB is too small to run the scan",
            arg(0)
        ),
        MEMORY_SIZE_TOO_BIG => format!(
            "requested memory size of {} MB could not be reserved",
            arg(0)
        ),
        PROTOCOL_VIOLATION => format!("protocol violation on the worker stream: {}", arg(0)),
        SCAN_FAILED => format!("the scan failed: {}", arg(0)),
        _ => format!("scan error #{code}"),
    }
}
