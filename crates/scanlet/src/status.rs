//! Status tree reported back to the controller's caller.
//!
//! One invocation builds exactly one tree: WARNING/FAILED frames from the
//! worker append leaves, and the root's severity, code and message are fixed
//! by the overall outcome when the worker process terminates.

use serde::Serialize;

/// Severity of a status node, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }
}

/// One element of a stack trace reconstructed from protocol text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntheticFrame {
    pub declaring: String,
    pub method: String,
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for SyntheticFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.declaring.is_empty() {
            write!(f, "{}({}:{})", self.method, self.file, self.line)
        } else {
            write!(
                f,
                "{}.{}({}:{})",
                self.declaring, self.method, self.file, self.line
            )
        }
    }
}

/// A stack trace reconstructed from parsed text.
///
/// This is never equated with a native error value; fidelity is only as good
/// as the lines the worker printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntheticException {
    /// The type-and-message line as printed by the worker.
    pub summary: String,
    pub frames: Vec<SyntheticFrame>,
}

impl std::fmt::Display for SyntheticException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary)?;
        for frame in &self.frames {
            write!(f, "\n\tat {frame}")?;
        }
        Ok(())
    }
}

/// One node in the result tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusNode {
    pub severity: Severity,
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<SyntheticException>,
    pub children: Vec<StatusNode>,
}

impl StatusNode {
    pub fn new(
        severity: Severity,
        code: i32,
        message: impl Into<String>,
        cause: Option<SyntheticException>,
    ) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            cause,
            children: Vec::new(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Severity::Ok, crate::codes::OK, message, None)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, crate::codes::OK, message, None)
    }

    pub fn warning(
        code: i32,
        message: impl Into<String>,
        cause: Option<SyntheticException>,
    ) -> Self {
        Self::new(Severity::Warning, code, message, cause)
    }

    pub fn error(code: i32, message: impl Into<String>, cause: Option<SyntheticException>) -> Self {
        Self::new(Severity::Error, code, message, cause)
    }

    pub fn cancel(code: i32, message: impl Into<String>) -> Self {
        Self::new(Severity::Cancel, code, message, None)
    }

    pub fn with_child(mut self, child: StatusNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The most severe severity anywhere in the tree.
    pub fn worst_severity(&self) -> Severity {
        self.children
            .iter()
            .map(StatusNode::worst_severity)
            .fold(self.severity, Severity::max)
    }

    /// Visit every leaf in document order.
    pub fn for_each_leaf<'a>(&'a self, visit: &mut impl FnMut(&'a StatusNode)) {
        if self.children.is_empty() {
            visit(self);
        } else {
            for child in &self.children {
                child.for_each_leaf(visit);
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Collects leaves during an invocation; frozen into the root node once the
/// worker process has terminated.
#[derive(Debug, Default)]
pub struct StatusBuilder {
    children: Vec<StatusNode>,
}

impl StatusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, child: StatusNode) {
        self.children.push(child);
    }

    pub fn add_warning(
        &mut self,
        code: i32,
        message: impl Into<String>,
        cause: Option<SyntheticException>,
    ) {
        self.children.push(StatusNode::warning(code, message, cause));
    }

    pub fn add_error(
        &mut self,
        code: i32,
        message: impl Into<String>,
        cause: Option<SyntheticException>,
    ) {
        self.children.push(StatusNode::error(code, message, cause));
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn build(self, severity: Severity, code: i32, message: impl Into<String>) -> StatusNode {
        StatusNode {
            severity,
            code,
            message: message.into(),
            cause: None,
            children: self.children,
        }
    }
}
