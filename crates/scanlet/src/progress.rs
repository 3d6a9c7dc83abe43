//! Nested progress bookkeeping for the controller's read loop.
//!
//! The worker reports a flat stream of TASK/SUBTASK/WORK/DONE frames; the
//! [`TaskStack`] folds that stream into nested scopes and forwards scaled,
//! clamped progress to the single top-level monitor supplied by the caller.

/// The caller-facing progress sink.
///
/// This is the interface a host environment implements to drive and observe
/// a scan. Cancellation is polled through [`ProgressMonitor::is_canceled`];
/// nothing here is ever called from more than one thread at a time.
pub trait ProgressMonitor: Send {
    fn begin(&mut self, total_work: u32);
    fn worked(&mut self, units: u32);
    fn sub_task(&mut self, name: &str);
    fn sub_task_done(&mut self);
    fn is_canceled(&self) -> bool;
    fn done(&mut self);
}

/// A monitor that discards everything and never cancels.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn begin(&mut self, _total_work: u32) {}
    fn worked(&mut self, _units: u32) {}
    fn sub_task(&mut self, _name: &str) {}
    fn sub_task_done(&mut self) {}
    fn is_canceled(&self) -> bool {
        false
    }
    fn done(&mut self) {}
}

/// Violations of the nesting rules; fatal to the session.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgressViolation {
    #[error("DONE received with no open task scope")]
    DoneOnEmptyStack,
    #[error("task {name:?} declared zero total work")]
    ZeroTotal { name: String },
}

/// Result of popping a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// Inner scope finished; the session continues.
    Continue,
    /// The outermost scope finished; the session is complete.
    OuterDone,
}

#[derive(Debug)]
struct TaskScope {
    name: String,
    total: u32,
    worked: u32,
    /// Units of the parent's budget this scope may consume.
    parent_alloc: u32,
    parent_reported: u32,
    /// Depth of the subtask-name stack below this scope's own name.
    names_below: usize,
}

impl TaskScope {
    /// Add units and return the ticks to forward to the parent.
    ///
    /// Completed units never decrease, and forwarded ticks never exceed the
    /// allocation, so the reported percentage stays within bounds no matter
    /// what the worker claims.
    fn advance(&mut self, units: u32) -> u32 {
        if units == 0 || self.worked >= self.total {
            return 0;
        }
        self.worked = (self.worked + units).min(self.total);
        let goal = ((self.worked as f64 / self.total as f64) * self.parent_alloc as f64).round()
            as u32;
        let goal = goal.min(self.parent_alloc);
        let ticks = goal.saturating_sub(self.parent_reported);
        self.parent_reported += ticks;
        ticks
    }

    /// Forward whatever allocation was not consumed, so the parent's totals
    /// line up when the scope closes early.
    fn leftover(&mut self) -> u32 {
        let ticks = self.parent_alloc - self.parent_reported;
        self.parent_reported = self.parent_alloc;
        ticks
    }

    fn remaining(&self) -> u32 {
        self.total - self.worked
    }
}

/// Maps the flat frame stream onto nested scopes.
#[derive(Debug)]
pub struct TaskStack {
    budget: u32,
    reported: u32,
    scopes: Vec<TaskScope>,
    names: Vec<String>,
}

impl TaskStack {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            reported: 0,
            scopes: Vec::new(),
            names: Vec::new(),
        }
    }

    pub fn begin(&self, sink: &mut dyn ProgressMonitor) {
        sink.begin(self.budget);
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Name of the innermost live scope, if any.
    pub fn innermost_name(&self) -> Option<&str> {
        self.scopes.last().map(|s| s.name.as_str())
    }

    pub fn on_task(
        &mut self,
        name: &str,
        total: u32,
        sink: &mut dyn ProgressMonitor,
    ) -> Result<(), ProgressViolation> {
        if total == 0 {
            return Err(ProgressViolation::ZeroTotal {
                name: name.to_string(),
            });
        }
        let parent_alloc = match self.scopes.last() {
            Some(parent) => parent.remaining(),
            None => self.budget - self.reported,
        };
        self.scopes.push(TaskScope {
            name: name.to_string(),
            total,
            worked: 0,
            parent_alloc,
            parent_reported: 0,
            names_below: self.names.len(),
        });
        self.names.push(name.to_string());
        sink.sub_task(name);
        Ok(())
    }

    pub fn on_sub_task(&mut self, name: &str, sink: &mut dyn ProgressMonitor) {
        self.names.push(name.to_string());
        sink.sub_task(name);
    }

    /// Closes the current subtask and re-announces the one beneath it, so the
    /// sink shows the enclosing name again rather than going blank.
    pub fn on_sub_task_done(&mut self, sink: &mut dyn ProgressMonitor) {
        let floor = self
            .scopes
            .last()
            .map(|s| s.names_below + 1)
            .unwrap_or(0);
        if self.names.len() > floor {
            self.names.pop();
            sink.sub_task_done();
            if let Some(previous) = self.names.last() {
                sink.sub_task(previous);
            }
        } else {
            tracing::warn!("SUBTASK_DONE with no matching SUBTASK");
            sink.sub_task_done();
        }
    }

    pub fn on_work(&mut self, units: u32, sink: &mut dyn ProgressMonitor) {
        let mut ticks = units;
        for scope in self.scopes.iter_mut().rev() {
            ticks = scope.advance(ticks);
            if ticks == 0 {
                return;
            }
        }
        self.report(ticks, sink);
    }

    pub fn on_done(
        &mut self,
        sink: &mut dyn ProgressMonitor,
    ) -> Result<StackEvent, ProgressViolation> {
        let mut scope = self
            .scopes
            .pop()
            .ok_or(ProgressViolation::DoneOnEmptyStack)?;
        let mut ticks = scope.leftover();
        for outer in self.scopes.iter_mut().rev() {
            if ticks == 0 {
                break;
            }
            ticks = outer.advance(ticks);
        }
        if ticks > 0 {
            self.report(ticks, sink);
        }
        self.names.truncate(scope.names_below);
        sink.sub_task_done();
        if let Some(previous) = self.names.last() {
            sink.sub_task(previous);
        }
        if self.scopes.is_empty() {
            Ok(StackEvent::OuterDone)
        } else {
            Ok(StackEvent::Continue)
        }
    }

    fn report(&mut self, ticks: u32, sink: &mut dyn ProgressMonitor) {
        let capped = ticks.min(self.budget - self.reported);
        if capped > 0 {
            self.reported += capped;
            sink.worked(capped);
        }
    }
}
