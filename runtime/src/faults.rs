//! Process-wide fault channel.
//!
//! Faults never stop the pipeline. Each one is logged, counted, and broadcast to
//! whoever subscribed through [`Bus::subscribe_faults`](crate::bus::Bus::subscribe_faults).
//! Lagging subscribers miss reports (see [`broadcast`]) but never slow down
//! consumption.

use crate::metrics::PipelineMetrics;
use scopebus_core::{
    ConsumeError, MessageId, MessageType, ObserverFailure, ScopeDisposalError, TransportError,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What went wrong.
#[derive(Debug, Clone)]
pub enum FaultKind {
    /// A message faulted (resolution, handler, pre-consume observer or decode failure)
    Consume(Arc<ConsumeError>),
    /// An observer failed outside the pre-consume phase
    Observer(Arc<ObserverFailure>),
    /// A message scope closed with release failures
    Disposal(Arc<ScopeDisposalError>),
    /// Releasing the root resolver's singletons failed during stop
    RootRelease(Arc<ScopeDisposalError>),
    /// `stop` gave up waiting for in-flight messages
    DrainTimeout {
        /// Invocations still running when the drain budget ran out
        abandoned: usize,
    },
    /// The transport reported an error
    Transport(TransportError),
    /// An invocation task ended without producing an outcome
    Aborted {
        /// Why the task ended
        reason: String,
    },
}

impl FaultKind {
    /// Label used for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Consume(_) => "consume",
            Self::Observer(_) => "observer",
            Self::Disposal(_) => "disposal",
            Self::RootRelease(_) => "root_release",
            Self::DrainTimeout { .. } => "drain_timeout",
            Self::Transport(_) => "transport",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// One reported fault.
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Message the fault belongs to, if any
    pub message_id: Option<MessageId>,
    /// Type of that message, if any
    pub message_type: Option<MessageType>,
    /// The fault itself
    pub kind: FaultKind,
}

impl FaultReport {
    /// A fault tied to a message
    #[must_use]
    pub const fn for_message(message_id: MessageId, message_type: MessageType, kind: FaultKind) -> Self {
        Self {
            message_id: Some(message_id),
            message_type: Some(message_type),
            kind,
        }
    }

    /// A fault of the bus itself
    #[must_use]
    pub const fn for_bus(kind: FaultKind) -> Self {
        Self {
            message_id: None,
            message_type: None,
            kind,
        }
    }
}

/// Broadcast sender shared by the bus and every invocation.
#[derive(Debug, Clone)]
pub struct FaultChannel {
    sender: broadcast::Sender<FaultReport>,
    queue: Arc<str>,
}

impl FaultChannel {
    /// Create a channel holding at most `capacity` unread reports per subscriber
    #[must_use]
    pub fn new(capacity: usize, queue: &str) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            queue: Arc::from(queue),
        }
    }

    /// Subscribe to reports published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FaultReport> {
        self.sender.subscribe()
    }

    /// Log, count and broadcast a fault
    pub fn report(&self, report: FaultReport) {
        let queue = &*self.queue;
        let message_id = report.message_id.as_ref().map(MessageId::as_str).unwrap_or_default();
        let message_type = report.message_type.as_ref().map(MessageType::as_str).unwrap_or_default();

        match &report.kind {
            FaultKind::Consume(error) => {
                tracing::error!(queue, message_id, message_type, kind = error.kind(), error = %error, "Message faulted");
            },
            FaultKind::Observer(failure) => {
                tracing::warn!(queue, message_id, message_type, phase = %failure.phase, error = %failure, "Observer failed");
            },
            FaultKind::Disposal(error) => {
                tracing::error!(queue, message_id, message_type, scope_id = %error.scope_id, failures = error.failures.len(), error = %error, "Scope disposal failed");
            },
            FaultKind::RootRelease(error) => {
                tracing::error!(queue, failures = error.failures.len(), error = %error, "Root release failed");
            },
            FaultKind::DrainTimeout { abandoned } => {
                tracing::error!(queue, abandoned, "Drain timed out; abandoning in-flight messages");
            },
            FaultKind::Transport(error) => {
                tracing::error!(queue, error = %error, "Transport error");
            },
            FaultKind::Aborted { reason } => {
                tracing::error!(queue, message_id, message_type, reason, "Invocation aborted");
            },
        }
        PipelineMetrics::record_fault(queue, report.kind.label());

        // No subscribers is fine: the fault has been logged.
        let _ = self.sender.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_reach_every_subscriber() {
        let channel = FaultChannel::new(4, "input_queue");
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        channel.report(FaultReport::for_bus(FaultKind::DrainTimeout { abandoned: 2 }));

        for receiver in [&mut first, &mut second] {
            let report = receiver.recv().await;
            assert!(matches!(
                report,
                Ok(FaultReport { kind: FaultKind::DrainTimeout { abandoned: 2 }, .. })
            ));
        }
    }

    #[tokio::test]
    async fn aborted_invocation_keeps_its_message_identity() {
        let channel = FaultChannel::new(4, "input_queue");
        let mut receiver = channel.subscribe();

        channel.report(FaultReport::for_message(
            MessageId::new("msg-1"),
            MessageType::new("urn:message:Test"),
            FaultKind::Aborted { reason: "task cancelled".into() },
        ));

        let report = receiver.recv().await;
        assert!(matches!(
            report,
            Ok(FaultReport { message_id: Some(ref id), kind: FaultKind::Aborted { .. }, .. }) if id.as_str() == "msg-1"
        ));
        assert_eq!(FaultKind::Aborted { reason: String::new() }.label(), "aborted");
    }

    #[test]
    fn reporting_without_subscribers_does_not_fail() {
        let channel = FaultChannel::new(0, "input_queue");
        channel.report(FaultReport::for_bus(FaultKind::Transport(TransportError::Closed)));
    }
}
