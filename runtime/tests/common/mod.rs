//! Shared fixtures for the bus integration tests.

#![allow(dead_code)] // Each test binary uses a different subset
#![allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic

use scopebus_core::prelude::*;
use scopebus_core::ScopeId;
use scopebus_runtime::{Bus, BusConfig};
use scopebus_testing::{
    DisposalProbe, EventJournal, InMemoryTransport, RecordingObserver, TrackedDependency,
    next_sequence,
};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleMessage {
    pub name: String,
}

impl Message for SimpleMessage {
    const MESSAGE_TYPE: &'static str = "urn:message:SimpleMessage";
}

pub fn simple(name: &str) -> Delivery {
    Delivery::json(&SimpleMessage { name: name.to_string() }).unwrap()
}

/// The error the faulting consumer raises
#[derive(Debug, Error)]
#[error("invalid operation while handling {0}")]
pub struct InvalidOperation(pub String);

// ============================================================================
// Consumer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

/// Holds a consumer inside `consume` until the test lets it through.
#[derive(Debug)]
pub struct Gate {
    entered: Notify,
    passes: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            passes: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.passes.acquire().await.unwrap().forget();
    }

    /// Wait until a consumer is blocked on the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let `count` consumers through
    pub fn open(&self, count: usize) {
        self.passes.add_permits(count);
    }
}

#[derive(Debug)]
pub struct ConsumerSettings {
    pub behaviour: Behaviour,
    pub gate: Option<Arc<Gate>>,
}

impl ConsumerSettings {
    pub const fn succeed() -> Self {
        Self {
            behaviour: Behaviour::Succeed,
            gate: None,
        }
    }

    pub const fn with(behaviour: Behaviour) -> Self {
        Self { behaviour, gate: None }
    }

    pub fn gated(gate: &Arc<Gate>) -> Self {
        Self {
            behaviour: Behaviour::Succeed,
            gate: Some(Arc::clone(gate)),
        }
    }
}

/// What the consumer saw while handling one message.
#[derive(Debug, Clone)]
pub struct Consumption {
    pub seq: u64,
    pub name: String,
    pub resolved_in: ScopeId,
    pub context_scope: ScopeId,
    pub dependency: usize,
    pub same_dependency_via_context: bool,
}

#[derive(Debug, Default)]
pub struct ConsumptionLog(Mutex<Vec<Consumption>>);

impl ConsumptionLog {
    fn push(&self, consumption: Consumption) {
        self.0.lock().unwrap().push(consumption);
    }

    pub fn entries(&self) -> Vec<Consumption> {
        self.0.lock().unwrap().clone()
    }
}

pub struct SimpleConsumer {
    dependency: Arc<TrackedDependency>,
    resolved_in: ScopeId,
    log: Arc<ConsumptionLog>,
    settings: Arc<ConsumerSettings>,
}

impl Consumer<SimpleMessage> for SimpleConsumer {
    fn consume<'a>(&'a self, context: &'a ConsumeContext, message: &'a SimpleMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(gate) = &self.settings.gate {
                gate.pass().await;
            }
            self.dependency.do_something(&message.name);

            let scope = context.scope().map_err(HandlerError::new)?;
            let via_context = scope.resolve::<TrackedDependency>().map_err(HandlerError::new)?;
            self.log.push(Consumption {
                seq: next_sequence(),
                name: message.name.clone(),
                resolved_in: self.resolved_in,
                context_scope: scope.id(),
                dependency: self.dependency.instance(),
                same_dependency_via_context: Arc::ptr_eq(&via_context, &self.dependency),
            });

            match self.settings.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(HandlerError::new(InvalidOperation(message.name.clone()))),
                Behaviour::Panic => panic!("consumer exploded on {}", message.name),
            }
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A bus wired to an in-memory transport, a disposal probe and a consumer log.
pub struct Harness {
    pub bus: Bus,
    pub transport: InMemoryTransport,
    pub probe: Arc<DisposalProbe>,
    pub log: Arc<ConsumptionLog>,
    pub journal: EventJournal,
}

impl Harness {
    pub fn new(settings: ConsumerSettings) -> Self {
        Self::with_config(settings, BusConfig::default())
    }

    pub fn with_config(settings: ConsumerSettings, config: BusConfig) -> Self {
        let probe = DisposalProbe::new();
        let log = Arc::new(ConsumptionLog::default());
        let registry = registry(&probe, &log, settings);

        let transport = InMemoryTransport::new();
        let bus = Bus::new(Arc::new(registry), Arc::new(transport.clone()), config);
        bus.consumer::<SimpleMessage, SimpleConsumer>().unwrap();

        Self {
            bus,
            transport,
            probe,
            log,
            journal: EventJournal::new(),
        }
    }

    /// Connect a recording observer sharing the harness journal
    pub fn observe(&self, name: &'static str) -> RecordingObserver {
        let observer = RecordingObserver::with_journal(name, &self.journal);
        self.bus.connect_observer(Arc::new(observer.clone())).unwrap();
        observer
    }
}

/// Registry with a scoped disposable dependency and the simple consumer.
pub fn registry(
    probe: &Arc<DisposalProbe>,
    log: &Arc<ConsumptionLog>,
    settings: ConsumerSettings,
) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    let dependencies = Arc::clone(probe);
    registry
        .add_scoped_disposable(move |_| Ok(dependencies.create()))
        .add_instance(Arc::clone(log))
        .add_instance(Arc::new(settings))
        .add_transient(|scope| {
            Ok(SimpleConsumer {
                dependency: scope.resolve()?,
                resolved_in: scope.id(),
                log: scope.resolve()?,
                settings: scope.resolve()?,
            })
        });
    registry
}
