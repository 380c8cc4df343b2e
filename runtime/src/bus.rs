//! Receive endpoint lifecycle.
//!
//! A [`Bus`] is configured while `Created` (consumer bindings and observers),
//! then started. Starting freezes the pipeline and spawns the receive loop,
//! which pulls deliveries from the [`Transport`] and consumes each one in its own
//! task. Stopping refuses new admissions, stops the receive loop, waits for the
//! in-flight invocations to be released, and finally releases the root
//! resolver's singletons.
//!
//! ```text
//! Created ──start──► Starting ──receiving──► Started ──stop──► Stopping ──drained──► Stopped
//! ```

use crate::binding::{BindingTable, ConsumerPipe};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::faults::{FaultChannel, FaultKind, FaultReport};
use crate::invoker::{ConsumerInvoker, DeliveryOutcome};
use crate::metrics::PipelineMetrics;
use crate::observer_chain::ObserverChain;
use futures::StreamExt;
use scopebus_core::{
    ConsumeObserver, Consumer, Delivery, DeliveryStream, Message, Resolver, ScopeFactory, Transport,
    TransportError,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Lifecycle state of a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    /// Being configured
    Created,
    /// `start` is opening the transport
    Starting,
    /// Receiving and consuming
    Started,
    /// No new admissions; draining in-flight messages
    Stopping,
    /// Drained and released
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Lifecycle {
    state: BusState,
    bindings: BindingTable,
    observers: ObserverChain,
    invoker: Option<Arc<ConsumerInvoker>>,
    receive_loop: Option<JoinHandle<()>>,
    stop_signal: Option<watch::Sender<bool>>,
}

struct BusInner {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    scopes: Arc<ScopeFactory>,
    faults: FaultChannel,
    lifecycle: Mutex<Lifecycle>,
    in_flight: Arc<watch::Sender<usize>>,
    stopped: OnceCell<Result<(), BusError>>,
}

/// Scoped-consumption receive endpoint.
///
/// Cheap to clone; clones share the same endpoint.
///
/// # Example
///
/// ```ignore
/// let mut registry = ServiceRegistry::new();
/// registry
///     .add_scoped_disposable(|_| Ok(SimpleDependency::default()))
///     .add_transient(|scope| Ok(SimpleConsumer { dependency: scope.resolve()? }));
///
/// let bus = Bus::new(Arc::new(registry), transport, BusConfig::default());
/// bus.consumer::<SimpleMessage, SimpleConsumer>()?;
/// bus.connect_observer(Arc::new(LoggingObserver))?;
///
/// let handle = bus.start().await?;
/// // ...
/// handle.stop(None).await?;
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus over a root resolver and a transport
    #[must_use]
    pub fn new(resolver: Arc<dyn Resolver>, transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        let (in_flight, _) = watch::channel(0_usize);
        let faults = FaultChannel::new(config.fault_channel_capacity, &config.queue_name);
        Self {
            inner: Arc::new(BusInner {
                config,
                transport,
                scopes: Arc::new(ScopeFactory::new(resolver)),
                faults,
                lifecycle: Mutex::new(Lifecycle {
                    state: BusState::Created,
                    bindings: BindingTable::new(),
                    observers: ObserverChain::new(),
                    invoker: None,
                    receive_loop: None,
                    stop_signal: None,
                }),
                in_flight: Arc::new(in_flight),
                stopped: OnceCell::new(),
            }),
        }
    }

    /// Bind consumer `C` to message type `M`
    ///
    /// `C` is resolved from each message's scope, so it must be registered with
    /// the resolver.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PipelineAlreadyStarted`] once the bus has started.
    pub fn consumer<M, C>(&self) -> Result<(), BusError>
    where
        M: Message,
        C: Consumer<M>,
    {
        let mut lifecycle = self.inner.lock();
        if lifecycle.state != BusState::Created {
            return Err(BusError::PipelineAlreadyStarted);
        }
        lifecycle.bindings.insert(Arc::new(ConsumerPipe::<M, C>::new()));
        tracing::debug!(
            message_type = M::MESSAGE_TYPE,
            consumer = std::any::type_name::<C>(),
            "Consumer bound"
        );
        Ok(())
    }

    /// Append a lifecycle observer
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PipelineAlreadyStarted`] once the bus has started.
    pub fn connect_observer(&self, observer: Arc<dyn ConsumeObserver>) -> Result<(), BusError> {
        let mut lifecycle = self.inner.lock();
        if lifecycle.state != BusState::Created {
            return Err(BusError::PipelineAlreadyStarted);
        }
        lifecycle.observers.push(observer);
        Ok(())
    }

    /// Open the transport, freeze the pipeline and start receiving.
    ///
    /// # Errors
    ///
    /// - [`BusError::AlreadyStarted`] unless the bus is `Created`
    /// - [`BusError::Transport`] if the transport cannot start receiving
    #[tracing::instrument(skip(self), fields(queue = %self.inner.config.queue_name))]
    pub async fn start(&self) -> Result<BusHandle, BusError> {
        let starting = StartingGuard::enter(&self.inner)?;
        let deliveries = self.inner.transport.receive().await?;

        let mut lifecycle = self.inner.lock();
        starting.disarm();

        let invoker = Arc::new(ConsumerInvoker::new(
            Arc::clone(&self.inner.scopes),
            Arc::new(std::mem::take(&mut lifecycle.bindings)),
            Arc::new(std::mem::take(&mut lifecycle.observers)),
            self.inner.faults.clone(),
            &self.inner.config.queue_name,
        ));
        let (stop_signal, stop) = watch::channel(false);
        let receive_loop = tokio::spawn(receive_loop(Arc::clone(&self.inner), deliveries, stop));

        lifecycle.invoker = Some(invoker);
        lifecycle.receive_loop = Some(receive_loop);
        lifecycle.stop_signal = Some(stop_signal);
        lifecycle.state = BusState::Started;
        drop(lifecycle);
        tracing::info!("Bus started");

        Ok(BusHandle { bus: self.clone() })
    }

    /// Consume one delivery directly, bypassing the transport.
    ///
    /// The invocation runs in its own task: dropping the returned future does
    /// not cancel it, and its scope is still closed when it finishes.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotAccepting`] unless the bus is `Started`
    /// - [`BusError::InvocationAborted`] if the invocation task ended without
    ///   an outcome
    #[tracing::instrument(skip_all, fields(message_id = %delivery.message_id()))]
    pub async fn dispatch(&self, delivery: Delivery) -> Result<DeliveryOutcome, BusError> {
        let (invoker, guard) = self.inner.admit()?;
        let message_id = delivery.message_id().clone();
        let message_type = delivery.message_type().clone();

        let invocation = tokio::spawn(
            async move {
                let _guard = guard;
                invoker.invoke(delivery).await
            }
            .in_current_span(),
        );

        invocation.await.map_err(|error| {
            let reason = error.to_string();
            self.inner.faults.report(FaultReport::for_message(
                message_id.clone(),
                message_type,
                FaultKind::Aborted { reason: reason.clone() },
            ));
            BusError::InvocationAborted { message_id, reason }
        })
    }

    /// Stop the bus.
    ///
    /// `timeout` overrides [`BusConfig::drain_timeout`] for this call. Every call
    /// after the first returns the first call's result.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotStarted`] if the bus was never started
    /// - [`BusError::DrainTimeout`] if in-flight messages outlived the drain
    ///   budget; the bus is stopped anyway
    #[tracing::instrument(skip(self), fields(queue = %self.inner.config.queue_name))]
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), BusError> {
        if matches!(self.state(), BusState::Created | BusState::Starting) {
            return Err(BusError::NotStarted);
        }
        let timeout = timeout.or(self.inner.config.drain_timeout);
        self.inner
            .stopped
            .get_or_init(|| self.inner.shutdown(timeout))
            .await
            .clone()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> BusState {
        self.inner.lock().state
    }

    /// Subscribe to fault reports published from now on
    #[must_use]
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FaultReport> {
        self.inner.faults.subscribe()
    }

    /// Number of invocations admitted and not yet released
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Number of message scopes currently open
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.inner.scopes.open_scopes()
    }

    /// The bus configuration
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("queue", &self.inner.config.queue_name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Handle to a started bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    bus: Bus,
}

impl BusHandle {
    /// Stop the bus; same as [`Bus::stop`]
    ///
    /// # Errors
    ///
    /// See [`Bus::stop`].
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), BusError> {
        self.bus.stop(timeout).await
    }

    /// The started bus
    #[must_use]
    pub const fn bus(&self) -> &Bus {
        &self.bus
    }
}

/// Holds the bus in `Starting` while the transport opens; puts it back to
/// `Created` if `start` fails or is cancelled before it completes.
struct StartingGuard<'a> {
    inner: &'a BusInner,
    armed: bool,
}

impl<'a> StartingGuard<'a> {
    fn enter(inner: &'a BusInner) -> Result<Self, BusError> {
        let mut lifecycle = inner.lock();
        if lifecycle.state != BusState::Created {
            return Err(BusError::AlreadyStarted);
        }
        lifecycle.state = BusState::Starting;
        Ok(Self { inner, armed: true })
    }

    /// Keep the state; the caller completes the transition under its own lock
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().state = BusState::Created;
            tracing::debug!("Start abandoned, bus back to created");
        }
    }
}

/// Decrements the in-flight count when the invocation is released.
struct InFlightGuard {
    in_flight: Arc<watch::Sender<usize>>,
    queue: Arc<str>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut remaining = 0;
        self.in_flight.send_modify(|count| {
            *count = count.saturating_sub(1);
            remaining = *count;
        });
        PipelineMetrics::record_in_flight(&self.queue, remaining);
    }
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one invocation; the state check and the increment happen under the
    /// lifecycle lock so `stop` never misses an admitted invocation.
    fn admit(&self) -> Result<(Arc<ConsumerInvoker>, InFlightGuard), BusError> {
        let lifecycle = self.lock();
        let invoker = match (&lifecycle.state, &lifecycle.invoker) {
            (BusState::Started, Some(invoker)) => Arc::clone(invoker),
            _ => return Err(BusError::NotAccepting),
        };

        let mut admitted = 0;
        self.in_flight.send_modify(|count| {
            *count += 1;
            admitted = *count;
        });
        PipelineMetrics::record_in_flight(&self.config.queue_name, admitted);

        Ok((
            invoker,
            InFlightGuard {
                in_flight: Arc::clone(&self.in_flight),
                queue: Arc::from(self.config.queue_name.as_str()),
            },
        ))
    }

    async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), BusError> {
        let (receive_loop, stop_signal) = {
            let mut lifecycle = self.lock();
            lifecycle.state = BusState::Stopping;
            (lifecycle.receive_loop.take(), lifecycle.stop_signal.take())
        };
        tracing::info!(in_flight = *self.in_flight.borrow(), "Stopping bus");

        if let Some(stop_signal) = stop_signal {
            let _ = stop_signal.send(true);
        }
        if let Some(receive_loop) = receive_loop {
            if let Err(error) = receive_loop.await {
                tracing::error!(%error, "Receive loop terminated abnormally");
            }
        }

        let result = self.drain(timeout).await;

        if let Err(error) = self.scopes.release_root().await {
            self.faults
                .report(FaultReport::for_bus(FaultKind::RootRelease(Arc::new(error))));
        }

        self.lock().state = BusState::Stopped;
        tracing::info!(open_scopes = self.scopes.open_scopes(), "Bus stopped");
        result
    }

    async fn drain(&self, timeout: Option<Duration>) -> Result<(), BusError> {
        let mut in_flight = self.in_flight.subscribe();
        let drained = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, in_flight.wait_for(|count| *count == 0))
                .await
                .is_ok(),
            None => {
                let _ = in_flight.wait_for(|count| *count == 0).await;
                true
            },
        };
        if drained {
            tracing::debug!("All in-flight messages released");
            return Ok(());
        }

        let abandoned = *self.in_flight.borrow();
        self.faults
            .report(FaultReport::for_bus(FaultKind::DrainTimeout { abandoned }));
        Err(BusError::DrainTimeout { abandoned })
    }
}

async fn receive_loop(inner: Arc<BusInner>, mut deliveries: DeliveryStream, mut stop: watch::Receiver<bool>) {
    let limiter = inner
        .config
        .concurrency_limit
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    tracing::debug!(concurrency_limit = ?inner.config.concurrency_limit, "Receive loop running");

    loop {
        let permit = match &limiter {
            Some(limiter) => tokio::select! {
                biased;
                _ = stop.changed() => break,
                permit = Arc::clone(limiter).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let Ok((invoker, guard)) = inner.admit() else {
                    tracing::warn!(message_id = %delivery.message_id(), "Bus stopping, delivery not admitted");
                    break;
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    invoker.invoke(delivery).await;
                });
            },
            Some(Err(TransportError::Closed)) => {
                inner
                    .faults
                    .report(FaultReport::for_bus(FaultKind::Transport(TransportError::Closed)));
                break;
            },
            Some(Err(error)) => {
                inner.faults.report(FaultReport::for_bus(FaultKind::Transport(error)));
            },
            None => {
                tracing::info!("Transport stream ended");
                break;
            },
        }
    }
    tracing::debug!("Receive loop stopped");
}
