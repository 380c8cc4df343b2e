//! Integration tests for per-message consumption
//!
//! Each delivery is consumed inside its own scope: observers see the scope in the
//! payload bag, the consumer's dependencies come from that scope, and the scope's
//! release hooks run once the observers are done, whatever the outcome.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{Behaviour, ConsumerSettings, Harness, InvalidOperation, SimpleMessage, simple};
use scopebus_core::{
    ConsumeError, ConsumeObserver, ConsumeContext, Delivery, HandlerError, ObserverError,
    ObserverFuture, ObserverPhase, PanicError, ResolutionError, ServiceRegistry,
};
use scopebus_runtime::{Bus, BusConfig, ConsumeStatus, FaultKind};
use scopebus_testing::{
    DisposalProbe, InMemoryTransport, ProbeAction, ProbeDisposalError, TrackedDependency, init_tracing,
};
use std::sync::{Arc, Mutex};

/// Resolves the scoped dependency from the payload scope after consumption.
#[derive(Default)]
struct ScopedDependencyObserver {
    /// `(instance, already disposed)` per PostConsume
    seen: Mutex<Vec<(usize, bool)>>,
}

impl ConsumeObserver for ScopedDependencyObserver {
    fn post_consume<'a>(&'a self, context: &'a ConsumeContext) -> ObserverFuture<'a> {
        Box::pin(async move {
            let scope = context.scope().map_err(ObserverError::new)?;
            let dependency = scope.resolve::<TrackedDependency>().map_err(ObserverError::new)?;
            self.seen
                .lock()
                .unwrap()
                .push((dependency.instance(), dependency.is_disposed()));
            Ok(())
        })
    }
}

// ============================================================================
// Success and fault scenarios
// ============================================================================

#[tokio::test]
async fn test_joe_is_consumed_in_its_own_scope() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.observe("observer");
    let lifestyle = Arc::new(ScopedDependencyObserver::default());
    harness.bus.connect_observer(Arc::clone(&lifestyle) as Arc<dyn ConsumeObserver>)?;
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    assert!(outcome.is_completed());
    assert!(outcome.observer_failures.is_empty());
    assert!(outcome.disposal.is_none());

    // Observer: pre once, post once, no fault; scope open during both
    let events = harness.journal.events();
    assert_eq!(
        harness.journal.sequence(),
        vec![
            ("observer", ObserverPhase::PreConsume),
            ("observer", ObserverPhase::PostConsume),
        ]
    );
    assert!(events.iter().all(|event| event.scope_open));
    assert!(events.iter().all(|event| event.scope_id == outcome.scope_id));

    // Consumer: invoked once with Joe, the context's scope is the resolving scope
    let consumed = harness.log.entries();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].name, "Joe");
    assert_eq!(Some(consumed[0].resolved_in), outcome.scope_id);
    assert_eq!(consumed[0].context_scope, consumed[0].resolved_in);
    assert!(consumed[0].same_dependency_via_context);

    // PostConsume: the payload scope still yields the instance the consumer used
    assert_eq!(*lifestyle.seen.lock().unwrap(), vec![(consumed[0].dependency, false)]);
    assert!(
        harness
            .probe
            .events_of(consumed[0].dependency)
            .iter()
            .any(|event| event.action == ProbeAction::Used("Joe".into()))
    );

    // Dependency: used with Joe, released exactly once after PostConsume
    assert_eq!(harness.probe.values(), vec!["Joe".to_string()]);
    assert_eq!(harness.probe.created(), 1);
    assert_eq!(harness.probe.disposed(), 1);
    let disposed_at = harness
        .probe
        .events()
        .iter()
        .find(|event| event.action == ProbeAction::Disposed)
        .map(|event| event.seq)
        .unwrap();
    assert!(disposed_at > events[1].seq);
    assert!(disposed_at > consumed[0].seq);

    assert_eq!(harness.bus.open_scopes(), 0);
    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_handler_fault_reaches_observers_and_still_releases() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::with(Behaviour::Fail));
    harness.observe("observer");
    let mut faults = harness.bus.subscribe_faults();
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    let fault = outcome.fault().expect("message should fault");
    let handler = fault.handler_error().expect("fault should come from the handler");
    assert!(handler.downcast_ref::<InvalidOperation>().is_some());

    assert_eq!(harness.journal.count(ObserverPhase::ConsumeFault), 1);
    assert_eq!(harness.journal.count(ObserverPhase::PostConsume), 0);
    let fault_event = &harness.journal.events()[1];
    assert_eq!(fault_event.phase, ObserverPhase::ConsumeFault);
    assert!(fault_event.fault.as_deref().unwrap().contains("invalid operation"));

    assert_eq!(harness.probe.disposed(), 1);
    assert_eq!(harness.bus.open_scopes(), 0);

    let report = faults.recv().await?;
    assert_eq!(report.message_id.as_ref(), Some(&outcome.message_id));
    assert!(matches!(report.kind, FaultKind::Consume(ref error) if error.handler_error().is_some()));

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_panicking_handler_is_a_fault() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::with(Behaviour::Panic));
    harness.observe("observer");
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    let handler = outcome.fault().and_then(ConsumeError::handler_error).unwrap();
    let panic = handler.downcast_ref::<PanicError>().unwrap();
    assert!(panic.0.contains("consumer exploded on Joe"));
    assert_eq!(harness.journal.count(ObserverPhase::ConsumeFault), 1);
    assert_eq!(harness.probe.disposed(), 1);

    harness.bus.stop(None).await?;
    Ok(())
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn test_observers_run_in_registration_order() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.observe("first");
    harness.observe("second");
    harness.observe("third");
    harness.bus.start().await?;

    harness.bus.dispatch(simple("Joe")).await?;

    assert_eq!(
        harness.journal.sequence(),
        vec![
            ("first", ObserverPhase::PreConsume),
            ("second", ObserverPhase::PreConsume),
            ("third", ObserverPhase::PreConsume),
            ("first", ObserverPhase::PostConsume),
            ("second", ObserverPhase::PostConsume),
            ("third", ObserverPhase::PostConsume),
        ]
    );

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_pre_consume_failure_aborts_and_faults_once() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.observe("first");
    harness
        .bus
        .connect_observer(Arc::new(
            scopebus_testing::RecordingObserver::with_journal("second", &harness.journal)
                .failing_on(ObserverPhase::PreConsume),
        ))?;
    harness.observe("third");
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    match outcome.fault() {
        Some(ConsumeError::Observer(failure)) => {
            assert_eq!(failure.phase, ObserverPhase::PreConsume);
            assert_eq!(failure.index, 1);
        },
        other => panic!("expected an observer fault, got {other:?}"),
    }
    assert_eq!(
        harness.journal.sequence(),
        vec![
            ("first", ObserverPhase::PreConsume),
            ("second", ObserverPhase::PreConsume),
            ("first", ObserverPhase::ConsumeFault),
            ("second", ObserverPhase::ConsumeFault),
            ("third", ObserverPhase::ConsumeFault),
        ]
    );
    assert!(harness.log.entries().is_empty());
    assert_eq!(harness.bus.open_scopes(), 0);

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_post_consume_failure_does_not_change_outcome() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness
        .bus
        .connect_observer(Arc::new(
            scopebus_testing::RecordingObserver::with_journal("flaky", &harness.journal)
                .failing_on(ObserverPhase::PostConsume),
        ))?;
    harness.observe("steady");
    let mut faults = harness.bus.subscribe_faults();
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    assert!(outcome.is_completed());
    assert_eq!(outcome.observer_failures.len(), 1);
    assert_eq!(outcome.observer_failures[0].phase, ObserverPhase::PostConsume);
    assert_eq!(outcome.observer_failures[0].index, 0);
    assert_eq!(harness.journal.count(ObserverPhase::PostConsume), 2);
    assert_eq!(harness.journal.count(ObserverPhase::ConsumeFault), 0);

    let report = faults.recv().await?;
    assert!(matches!(report.kind, FaultKind::Observer(_)));

    harness.bus.stop(None).await?;
    Ok(())
}

struct ExplodingObserver;

impl ConsumeObserver for ExplodingObserver {
    fn consume_fault<'a>(&'a self, _context: &'a ConsumeContext, _error: &'a ConsumeError) -> ObserverFuture<'a> {
        Box::pin(async { explode() })
    }
}

fn explode() -> Result<(), scopebus_core::ObserverError> {
    panic!("fault observer exploded")
}

#[tokio::test]
async fn test_fault_observer_panic_is_contained() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::with(Behaviour::Fail));
    harness.bus.connect_observer(Arc::new(ExplodingObserver))?;
    harness.observe("after");
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    assert!(outcome.fault().and_then(ConsumeError::handler_error).is_some());
    assert_eq!(outcome.observer_failures.len(), 1);
    assert!(outcome.observer_failures[0].error.downcast_ref::<PanicError>().is_some());
    assert_eq!(harness.journal.count(ObserverPhase::ConsumeFault), 1);
    assert_eq!(harness.probe.disposed(), 1);

    harness.bus.stop(None).await?;
    Ok(())
}

// ============================================================================
// Resolution and scopes
// ============================================================================

#[tokio::test]
async fn test_resolution_failure_skips_execution() -> anyhow::Result<()> {
    let transport = InMemoryTransport::new();
    // The consumer's dependency is not registered
    let mut registry = ServiceRegistry::new();
    registry.add_transient(|scope| {
        let _missing = scope.resolve::<common::ConsumptionLog>()?;
        Ok(NeverConsumer)
    });
    let bus = Bus::new(Arc::new(registry), Arc::new(transport), BusConfig::default());
    bus.consumer::<SimpleMessage, NeverConsumer>()?;
    let observer = scopebus_testing::RecordingObserver::new("observer");
    bus.connect_observer(Arc::new(observer.clone()))?;
    bus.start().await?;

    let outcome = bus.dispatch(simple("Joe")).await?;

    assert!(matches!(
        outcome.fault(),
        Some(ConsumeError::Resolution(ResolutionError::NotRegistered { .. }))
    ));
    assert_eq!(
        observer.journal().sequence(),
        vec![
            ("observer", ObserverPhase::PreConsume),
            ("observer", ObserverPhase::ConsumeFault),
        ]
    );
    assert_eq!(bus.open_scopes(), 0);

    bus.stop(None).await?;
    Ok(())
}

struct NeverConsumer;

impl scopebus_core::Consumer<SimpleMessage> for NeverConsumer {
    fn consume<'a>(
        &'a self,
        _context: &'a ConsumeContext,
        _message: &'a SimpleMessage,
    ) -> scopebus_core::HandlerFuture<'a> {
        Box::pin(async { Err(HandlerError::msg("must not run")) })
    }
}

#[tokio::test]
async fn test_scoped_dependency_is_shared_within_a_message_only() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.bus.start().await?;

    let first = harness.bus.dispatch(simple("first")).await?;
    let second = harness.bus.dispatch(simple("second")).await?;

    let consumed = harness.log.entries();
    assert_eq!(consumed.len(), 2);
    assert!(consumed.iter().all(|entry| entry.same_dependency_via_context));
    assert_ne!(consumed[0].dependency, consumed[1].dependency);
    assert_ne!(first.scope_id, second.scope_id);
    assert_eq!(harness.probe.created(), 2);
    assert_eq!(harness.probe.disposed(), 2);

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_disposal_failure_is_reported_even_on_success() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.probe.fail_disposals(true);
    let mut faults = harness.bus.subscribe_faults();
    harness.bus.start().await?;

    let outcome = harness.bus.dispatch(simple("Joe")).await?;

    assert!(outcome.is_completed());
    let disposal = outcome.disposal.as_ref().expect("disposal failure should be reported");
    assert_eq!(Some(disposal.scope_id), outcome.scope_id);
    assert_eq!(disposal.failures.len(), 1);
    assert!(disposal.failures[0].source.downcast_ref::<ProbeDisposalError>().is_some());

    let report = faults.recv().await?;
    assert!(matches!(report.kind, FaultKind::Disposal(_)));
    assert_eq!(harness.bus.open_scopes(), 0);

    harness.bus.stop(None).await?;
    Ok(())
}

// ============================================================================
// Deliveries the pipeline cannot consume
// ============================================================================

#[tokio::test]
async fn test_unbound_message_type_is_skipped() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.observe("observer");
    harness.bus.start().await?;

    let outcome = harness
        .bus
        .dispatch(Delivery::new("urn:message:Unknown", b"{}".to_vec()))
        .await?;

    assert!(outcome.is_skipped());
    assert!(outcome.scope_id.is_none());
    assert!(harness.journal.is_empty());
    assert_eq!(harness.probe.created(), 0);

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_malformed_body_faults_without_a_scope() -> anyhow::Result<()> {
    let harness = Harness::new(ConsumerSettings::succeed());
    harness.observe("observer");
    let mut faults = harness.bus.subscribe_faults();
    harness.bus.start().await?;

    let outcome = harness
        .bus
        .dispatch(Delivery::new(
            <SimpleMessage as scopebus_core::Message>::MESSAGE_TYPE,
            b"{\"nom\":1}".to_vec(),
        ))
        .await?;

    assert!(matches!(outcome.status, ConsumeStatus::Faulted(ref error) if matches!(**error, ConsumeError::Malformed { .. })));
    assert!(outcome.scope_id.is_none());
    assert!(harness.journal.is_empty());
    assert_eq!(harness.bus.open_scopes(), 0);

    let report = faults.recv().await?;
    assert!(matches!(report.kind, FaultKind::Consume(_)));

    harness.bus.stop(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_failing_message_does_not_block_the_next() -> anyhow::Result<()> {
    let probe = DisposalProbe::new();
    let log = Arc::new(common::ConsumptionLog::default());
    let registry = common::registry(&probe, &log, ConsumerSettings::succeed());
    let bus = Bus::new(Arc::new(registry), Arc::new(InMemoryTransport::new()), BusConfig::default());
    bus.consumer::<SimpleMessage, common::SimpleConsumer>()?;
    bus.start().await?;

    let malformed = bus
        .dispatch(Delivery::new(
            <SimpleMessage as scopebus_core::Message>::MESSAGE_TYPE,
            b"not json".to_vec(),
        ))
        .await?;
    let good = bus.dispatch(simple("Joe")).await?;

    assert!(malformed.is_faulted());
    assert!(good.is_completed());
    assert_eq!(log.entries().len(), 1);

    bus.stop(None).await?;
    Ok(())
}
