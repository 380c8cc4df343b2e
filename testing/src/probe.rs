//! Disposable dependency probe.
//!
//! [`DisposalProbe`] hands out [`TrackedDependency`] instances and counts how
//! many were created, used and disposed, so tests can assert that every scope
//! released what it created, exactly once.

use crate::next_sequence;
use scopebus_core::{AsyncDispose, BoxError, DisposeFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// What happened to a tracked dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    /// The dependency was built
    Created,
    /// `do_something` was called with this value
    Used(String),
    /// The release hook ran
    Disposed,
}

/// One probe event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Position in the process-wide test timeline
    pub seq: u64,
    /// Instance the event is about
    pub instance: usize,
    /// What happened
    pub action: ProbeAction,
}

/// Error raised by a probe configured to fail disposal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dependency #{instance} refused to dispose")]
pub struct ProbeDisposalError {
    /// Instance whose release hook failed
    pub instance: usize,
}

/// Shared counters for every [`TrackedDependency`] built from it.
#[derive(Debug, Default)]
pub struct DisposalProbe {
    next_instance: AtomicUsize,
    disposals: AtomicUsize,
    events: Mutex<Vec<ProbeEvent>>,
    fail_disposal: AtomicBool,
    dispose_delay: Mutex<Option<Duration>>,
}

impl DisposalProbe {
    /// A fresh probe
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a new tracked dependency
    #[must_use]
    pub fn create(self: &Arc<Self>) -> TrackedDependency {
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        self.push(instance, ProbeAction::Created);
        TrackedDependency {
            instance,
            probe: Arc::clone(self),
        }
    }

    /// Make every subsequent release hook fail
    pub fn fail_disposals(&self, fail: bool) {
        self.fail_disposal.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent release hook sleep first
    pub fn delay_disposals(&self, delay: Option<Duration>) {
        *self.dispose_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Number of dependencies built
    #[must_use]
    pub fn created(&self) -> usize {
        self.next_instance.load(Ordering::SeqCst)
    }

    /// Number of release hook calls (failed ones included)
    #[must_use]
    pub fn disposed(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Every event, in order
    #[must_use]
    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values passed to `do_something`, in order
    #[must_use]
    pub fn values(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event.action {
                ProbeAction::Used(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Events of one instance
    #[must_use]
    pub fn events_of(&self, instance: usize) -> Vec<ProbeEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.instance == instance)
            .collect()
    }

    fn push(&self, instance: usize, action: ProbeAction) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ProbeEvent {
                seq: next_sequence(),
                instance,
                action,
            });
    }

    fn dispose_delay(&self) -> Option<Duration> {
        *self.dispose_delay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A dependency whose use and release are observable through its probe.
#[derive(Debug)]
pub struct TrackedDependency {
    instance: usize,
    probe: Arc<DisposalProbe>,
}

impl TrackedDependency {
    /// Instance number, unique per probe
    #[must_use]
    pub const fn instance(&self) -> usize {
        self.instance
    }

    /// Record a use of the dependency
    pub fn do_something(&self, value: impl Into<String>) {
        self.probe.push(self.instance, ProbeAction::Used(value.into()));
    }

    /// Whether this instance's release hook has run
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.probe
            .events_of(self.instance)
            .iter()
            .any(|event| event.action == ProbeAction::Disposed)
    }
}

impl AsyncDispose for TrackedDependency {
    fn dispose(&self) -> DisposeFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            if let Some(delay) = self.probe.dispose_delay() {
                tokio::time::sleep(delay).await;
            }
            self.probe.disposals.fetch_add(1, Ordering::SeqCst);
            self.probe.push(self.instance, ProbeAction::Disposed);

            if self.probe.fail_disposal.load(Ordering::SeqCst) {
                return Err(ProbeDisposalError {
                    instance: self.instance,
                }
                .into());
            }
            Ok(())
        })
    }
}
