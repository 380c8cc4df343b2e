//! Per-message consumer invocation.
//!
//! [`ConsumerInvoker::invoke`] drives one delivery through the
//! [`InvocationState`] machine:
//!
//! ```text
//! Idle ──► Resolving ──► Executing ──► Completed ──┐
//!              │              │                    ├──► Released
//!              └──────────────┴──────► Faulted ────┘
//! ```
//!
//! Whatever happens between `Idle` and `Released` (observer failure, resolution
//! failure, handler error or panic) the message's scope is closed exactly once
//! before `invoke` returns.

use crate::binding::{BindingTable, ConsumerBinding};
use crate::faults::{FaultChannel, FaultKind, FaultReport};
use crate::metrics::PipelineMetrics;
use crate::observer_chain::ObserverChain;
use futures::FutureExt;
use scopebus_core::{
    ConsumeContext, ConsumeError, Delivery, HandlerError, MessageId, MessageType, ObserverFailure,
    PanicError, ResolutionError, ResourceScope, ScopeCloseError, ScopeDisposalError, ScopeFactory,
    ScopeId,
};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Not started
    Idle,
    /// Scope open; observers notified and consumer being resolved
    Resolving,
    /// Consumer running
    Executing,
    /// Consumer succeeded
    Completed,
    /// Observer, resolution or handler failure
    Faulted,
    /// Scope closed
    Released,
}

impl InvocationState {
    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Resolving)
                | (Self::Resolving, Self::Executing | Self::Faulted)
                | (Self::Executing, Self::Completed | Self::Faulted)
                | (Self::Completed | Self::Faulted, Self::Released)
        )
    }

    /// Whether the invocation is finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released)
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Final status of one delivery.
#[derive(Debug, Clone)]
pub enum ConsumeStatus {
    /// The consumer returned successfully
    Completed,
    /// Consumption faulted
    Faulted(Arc<ConsumeError>),
    /// No consumer is bound to the message type
    Skipped,
}

/// What happened to one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Message identifier
    pub message_id: MessageId,
    /// Message type
    pub message_type: MessageType,
    /// Final status
    pub status: ConsumeStatus,
    /// Scope the message was consumed in (`None` when no scope was opened)
    pub scope_id: Option<ScopeId>,
    /// Observer failures from the post-consume or fault phase
    pub observer_failures: Vec<Arc<ObserverFailure>>,
    /// Release failures reported when the scope closed
    pub disposal: Option<Arc<ScopeDisposalError>>,
}

impl DeliveryOutcome {
    fn without_scope(message_id: MessageId, message_type: MessageType, status: ConsumeStatus) -> Self {
        Self {
            message_id,
            message_type,
            status,
            scope_id: None,
            observer_failures: Vec::new(),
            disposal: None,
        }
    }

    /// Whether the consumer completed
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.status, ConsumeStatus::Completed)
    }

    /// Whether consumption faulted
    #[must_use]
    pub const fn is_faulted(&self) -> bool {
        matches!(self.status, ConsumeStatus::Faulted(_))
    }

    /// Whether the message was skipped
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self.status, ConsumeStatus::Skipped)
    }

    /// The fault, if consumption faulted
    #[must_use]
    pub fn fault(&self) -> Option<&ConsumeError> {
        match &self.status {
            ConsumeStatus::Faulted(error) => Some(error),
            _ => None,
        }
    }
}

struct Invocation {
    state: InvocationState,
}

impl Invocation {
    const fn new() -> Self {
        Self {
            state: InvocationState::Idle,
        }
    }

    fn advance(&mut self, next: InvocationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal invocation transition {} -> {next}",
            self.state
        );
        tracing::trace!(from = %self.state, to = %next, "Invocation state changed");
        self.state = next;
    }
}

/// Runs deliveries through scope, observers and consumer.
///
/// Shared by every concurrent invocation; holds no per-message state.
pub struct ConsumerInvoker {
    scopes: Arc<ScopeFactory>,
    bindings: Arc<BindingTable>,
    observers: Arc<ObserverChain>,
    faults: FaultChannel,
    queue: Arc<str>,
}

impl ConsumerInvoker {
    /// Create an invoker over a frozen pipeline
    #[must_use]
    pub fn new(
        scopes: Arc<ScopeFactory>,
        bindings: Arc<BindingTable>,
        observers: Arc<ObserverChain>,
        faults: FaultChannel,
        queue: &str,
    ) -> Self {
        Self {
            scopes,
            bindings,
            observers,
            faults,
            queue: Arc::from(queue),
        }
    }

    /// Consume one delivery.
    ///
    /// Never fails: every failure ends up in the returned [`DeliveryOutcome`] and
    /// on the fault channel.
    #[tracing::instrument(
        name = "consume",
        skip_all,
        fields(
            queue = %self.queue,
            message_id = %delivery.message_id(),
            message_type = %delivery.message_type(),
            scope_id = tracing::field::Empty,
        )
    )]
    pub async fn invoke(&self, delivery: Delivery) -> DeliveryOutcome {
        let (envelope, body) = delivery.into_parts();
        let message_id = envelope.message_id.clone();
        let message_type = envelope.message_type.clone();

        let Some(binding) = self.bindings.get(&message_type).cloned() else {
            tracing::warn!("No consumer bound to message type, skipping");
            PipelineMetrics::record_skipped(&self.queue);
            return DeliveryOutcome::without_scope(message_id, message_type, ConsumeStatus::Skipped);
        };

        let message = match binding.decode(&body) {
            Ok(message) => message,
            Err(source) => {
                let error = Arc::new(ConsumeError::Malformed {
                    message_type: message_type.clone(),
                    source,
                });
                self.report(&message_id, &message_type, FaultKind::Consume(Arc::clone(&error)));
                PipelineMetrics::record_faulted(&self.queue, error.kind(), None);
                return DeliveryOutcome::without_scope(
                    message_id,
                    message_type,
                    ConsumeStatus::Faulted(error),
                );
            },
        };

        let started = Instant::now();
        let mut invocation = Invocation::new();
        let scope = self.scopes.open();
        tracing::Span::current().record("scope_id", tracing::field::display(scope.id()));

        let context = ConsumeContext::new(envelope, message);
        if let Err(error) = context.payload().set(Arc::clone(&scope)) {
            tracing::error!(%error, "Context was already tagged with a scope");
        }
        invocation.advance(InvocationState::Resolving);

        let (status, observer_failures) =
            self.run(&mut invocation, binding.as_ref(), &scope, &context).await;

        drop(context);
        let disposal = self.close(&scope, &message_id, &message_type).await;
        invocation.advance(InvocationState::Released);

        let elapsed = started.elapsed();
        match &status {
            ConsumeStatus::Faulted(error) => {
                PipelineMetrics::record_faulted(&self.queue, error.kind(), Some(elapsed));
            },
            _ => PipelineMetrics::record_consumed(&self.queue, elapsed),
        }
        tracing::debug!(elapsed_ms = elapsed.as_millis(), "Message released");

        DeliveryOutcome {
            message_id,
            message_type,
            status,
            scope_id: Some(scope.id()),
            observer_failures,
            disposal,
        }
    }

    async fn run(
        &self,
        invocation: &mut Invocation,
        binding: &dyn ConsumerBinding,
        scope: &ResourceScope,
        context: &ConsumeContext,
    ) -> (ConsumeStatus, Vec<Arc<ObserverFailure>>) {
        match self.consume(invocation, binding, scope, context).await {
            Ok(()) => {
                invocation.advance(InvocationState::Completed);
                let failures = self.observers.post_consume(context).await;
                (ConsumeStatus::Completed, self.report_observer_failures(context, failures))
            },
            Err(error) => {
                invocation.advance(InvocationState::Faulted);
                let error = Arc::new(error);
                let failures = self.observers.consume_fault(context, &error).await;
                self.report(
                    context.message_id(),
                    context.message_type(),
                    FaultKind::Consume(Arc::clone(&error)),
                );
                let failures = self.report_observer_failures(context, failures);
                (ConsumeStatus::Faulted(error), failures)
            },
        }
    }

    async fn consume(
        &self,
        invocation: &mut Invocation,
        binding: &dyn ConsumerBinding,
        scope: &ResourceScope,
        context: &ConsumeContext,
    ) -> Result<(), ConsumeError> {
        self.observers.pre_consume(context).await?;

        let consumer = std::panic::catch_unwind(AssertUnwindSafe(|| binding.resolve(scope)))
            .unwrap_or_else(|payload| {
                Err(ResolutionError::Factory {
                    type_name: binding.consumer_name(),
                    source: Box::new(PanicError::from_payload(payload.as_ref())),
                })
            })?;
        invocation.advance(InvocationState::Executing);
        tracing::trace!(consumer = binding.consumer_name(), "Executing consumer");

        let outcome = AssertUnwindSafe(async { consumer.consume(context).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => result.map_err(ConsumeError::from),
            Err(payload) => Err(HandlerError::panicked(PanicError::from_payload(payload.as_ref())).into()),
        }
    }

    async fn close(
        &self,
        scope: &ResourceScope,
        message_id: &MessageId,
        message_type: &MessageType,
    ) -> Option<Arc<ScopeDisposalError>> {
        match self.scopes.close(scope).await {
            Ok(()) => None,
            Err(ScopeCloseError::Disposal(error)) => {
                let error = Arc::new(error);
                self.report(message_id, message_type, FaultKind::Disposal(Arc::clone(&error)));
                Some(error)
            },
            Err(ScopeCloseError::AlreadyClosed(closed)) => {
                tracing::error!(error = %closed, "Scope was closed before the invocation released it");
                None
            },
        }
    }

    fn report_observer_failures(
        &self,
        context: &ConsumeContext,
        failures: Vec<ObserverFailure>,
    ) -> Vec<Arc<ObserverFailure>> {
        failures
            .into_iter()
            .map(|failure| {
                let failure = Arc::new(failure);
                self.report(
                    context.message_id(),
                    context.message_type(),
                    FaultKind::Observer(Arc::clone(&failure)),
                );
                failure
            })
            .collect()
    }

    fn report(&self, message_id: &MessageId, message_type: &MessageType, kind: FaultKind) {
        self.faults.report(FaultReport::for_message(
            message_id.clone(),
            message_type.clone(),
            kind,
        ));
    }

    /// The invoker's scope factory
    #[must_use]
    pub const fn scopes(&self) -> &Arc<ScopeFactory> {
        &self.scopes
    }
}

impl fmt::Debug for ConsumerInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerInvoker")
            .field("queue", &self.queue)
            .field("bindings", &self.bindings)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}
