//! Observers that record what they were told, for ordering assertions.

use crate::next_sequence;
use scopebus_core::{
    ConsumeContext, ConsumeError, ConsumeObserver, MessageId, ObserverError, ObserverFuture,
    ObserverPhase, ScopeId,
};
use std::sync::{Arc, Mutex, PoisonError};

/// One observer notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    /// Position in the process-wide test timeline (see [`next_sequence`])
    pub seq: u64,
    /// Name of the observer that was notified
    pub observer: &'static str,
    /// Lifecycle phase
    pub phase: ObserverPhase,
    /// Message the notification was about
    pub message_id: MessageId,
    /// Scope found in the context's payload bag
    pub scope_id: Option<ScopeId>,
    /// Whether that scope was still open
    pub scope_open: bool,
    /// Rendered fault, for `ConsumeFault`
    pub fault: Option<String>,
}

/// Shared, ordered log of observer notifications.
#[derive(Debug, Clone, Default)]
pub struct EventJournal {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl EventJournal {
    /// Empty journal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Every recorded event, in notification order
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(observer, phase)` pairs, in notification order
    #[must_use]
    pub fn sequence(&self) -> Vec<(&'static str, ObserverPhase)> {
        self.events()
            .into_iter()
            .map(|event| (event.observer, event.phase))
            .collect()
    }

    /// Events recorded for one message
    #[must_use]
    pub fn for_message(&self, message_id: &MessageId) -> Vec<ObservedEvent> {
        self.events()
            .into_iter()
            .filter(|event| &event.message_id == message_id)
            .collect()
    }

    /// Number of notifications of `phase`
    #[must_use]
    pub fn count(&self, phase: ObserverPhase) -> usize {
        self.events().iter().filter(|event| event.phase == phase).count()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }
}

/// An observer that records every notification in an [`EventJournal`].
///
/// Several observers can share one journal to assert cross-observer ordering.
///
/// # Example
///
/// ```
/// use scopebus_core::ObserverPhase;
/// use scopebus_testing::{EventJournal, RecordingObserver};
///
/// let journal = EventJournal::new();
/// let first = RecordingObserver::with_journal("first", &journal);
/// let failing = RecordingObserver::with_journal("second", &journal).failing_on(ObserverPhase::PostConsume);
/// # let _ = (first, failing);
/// ```
#[derive(Debug, Clone)]
pub struct RecordingObserver {
    name: &'static str,
    journal: EventJournal,
    fail_on: Option<ObserverPhase>,
}

impl RecordingObserver {
    /// An observer with its own journal
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_journal(name, &EventJournal::new())
    }

    /// An observer recording into a shared journal
    #[must_use]
    pub fn with_journal(name: &'static str, journal: &EventJournal) -> Self {
        Self {
            name,
            journal: journal.clone(),
            fail_on: None,
        }
    }

    /// Fail (after recording) whenever notified of `phase`
    #[must_use]
    pub const fn failing_on(mut self, phase: ObserverPhase) -> Self {
        self.fail_on = Some(phase);
        self
    }

    /// The journal this observer records into
    #[must_use]
    pub const fn journal(&self) -> &EventJournal {
        &self.journal
    }

    fn record(&self, phase: ObserverPhase, context: &ConsumeContext, fault: Option<String>) -> ObserverFuture<'_> {
        let scope = context.scope().ok();
        self.journal.push(ObservedEvent {
            seq: next_sequence(),
            observer: self.name,
            phase,
            message_id: context.message_id().clone(),
            scope_id: scope.as_ref().map(|scope| scope.id()),
            scope_open: scope.as_ref().is_some_and(|scope| !scope.is_closed()),
            fault,
        });

        let result = if self.fail_on == Some(phase) {
            Err(ObserverError::msg(format!("{} refused {phase}", self.name)))
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(result))
    }
}

impl ConsumeObserver for RecordingObserver {
    fn pre_consume<'a>(&'a self, context: &'a ConsumeContext) -> ObserverFuture<'a> {
        self.record(ObserverPhase::PreConsume, context, None)
    }

    fn post_consume<'a>(&'a self, context: &'a ConsumeContext) -> ObserverFuture<'a> {
        self.record(ObserverPhase::PostConsume, context, None)
    }

    fn consume_fault<'a>(&'a self, context: &'a ConsumeContext, error: &'a ConsumeError) -> ObserverFuture<'a> {
        self.record(ObserverPhase::ConsumeFault, context, Some(error.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use scopebus_core::Delivery;

    fn context() -> ConsumeContext {
        let (envelope, _) = Delivery::new("urn:message:Test", Vec::new()).into_parts();
        ConsumeContext::new(envelope, Box::new(()))
    }

    #[tokio::test]
    async fn records_in_notification_order() {
        let journal = EventJournal::new();
        let first = RecordingObserver::with_journal("first", &journal);
        let second = RecordingObserver::with_journal("second", &journal);
        let context = context();

        first.pre_consume(&context).await.unwrap();
        second.pre_consume(&context).await.unwrap();
        first.post_consume(&context).await.unwrap();

        assert_eq!(
            journal.sequence(),
            vec![
                ("first", ObserverPhase::PreConsume),
                ("second", ObserverPhase::PreConsume),
                ("first", ObserverPhase::PostConsume),
            ]
        );
        assert_eq!(journal.events()[0].scope_id, None);
    }

    #[tokio::test]
    async fn failing_phase_still_records() {
        let observer = RecordingObserver::new("flaky").failing_on(ObserverPhase::PreConsume);
        let context = context();

        assert!(observer.pre_consume(&context).await.is_err());
        assert!(observer.post_consume(&context).await.is_ok());
        assert_eq!(observer.journal().count(ObserverPhase::PreConsume), 1);
    }
}
