//! Tracing layer that forwards the job's log records over the protocol.
//!
//! Error records become FAILED frames and warnings become WARNING frames,
//! so the controller folds them into the status tree. Events from this
//! crate's own targets are skipped; encoding a frame must never log its way
//! into another frame.

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::worker::WorkerMonitor;

pub struct WorkerLogLayer {
    monitor: WorkerMonitor,
}

impl WorkerLogLayer {
    pub fn new(monitor: WorkerMonitor) -> Self {
        Self { monitor }
    }
}

impl<S> Layer<S> for WorkerLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with("scanlet") {
            return;
        }
        let level = *metadata.level();
        if level != Level::ERROR && level != Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }

        if level == Level::ERROR {
            self.monitor.failed(&visitor.message, None);
        } else {
            self.monitor.error(&visitor.message);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlFrame, Frame};
    use crate::worker::WorkerMonitor;
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::layer::SubscriberExt;

    fn scoped_events(emit: impl FnOnce()) -> Vec<Frame> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = WorkerMonitor::new(tx, CancellationToken::new());
        let subscriber = tracing_subscriber::registry().with(WorkerLogLayer::new(monitor));
        tracing::subscriber::with_default(subscriber, emit);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn error_records_become_failed_frames() {
        let frames = scoped_events(|| {
            tracing::error!(target: "tool::scan", "rule engine blew up");
        });
        assert_eq!(
            frames[0],
            Frame::Control(ControlFrame::Failed {
                message: "rule engine blew up".to_string(),
            })
        );
    }

    #[test]
    fn warn_records_become_warning_frames() {
        let frames = scoped_events(|| {
            tracing::warn!(target: "tool::scan", "deprecated rule");
        });
        assert_eq!(
            frames[0],
            Frame::Control(ControlFrame::Warning {
                message: "deprecated rule".to_string(),
            })
        );
    }

    #[test]
    fn info_records_are_ignored() {
        let frames = scoped_events(|| {
            tracing::info!(target: "tool::scan", "just chatting");
        });
        assert!(frames.is_empty());
    }

    #[test]
    fn own_targets_are_filtered() {
        let frames = scoped_events(|| {
            tracing::error!(target: "scanlet::run", "internal noise");
        });
        assert!(frames.is_empty());
    }
}
