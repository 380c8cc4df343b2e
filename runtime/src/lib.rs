//! # Scopebus Runtime
//!
//! Runtime for the scoped consumption pipeline.
//!
//! This crate wires the `scopebus-core` building blocks into a receive endpoint:
//! every delivery is consumed in its own task and its own scope, observers are
//! notified around the consumer call, and the scope is closed before the
//! invocation is released.
//!
//! ## Core Components
//!
//! - **Bus**: lifecycle (`start` / `stop`), consumer bindings and observer registration
//! - **`ConsumerInvoker`**: drives one delivery through resolve → execute → release
//! - **`ObserverChain`**: ordered pre / post / fault notifications
//! - **`FaultChannel`**: broadcast of every fault, also logged and counted
//!
//! ## Example
//!
//! ```ignore
//! use scopebus_runtime::{Bus, BusConfig};
//!
//! let bus = Bus::new(Arc::new(registry), transport, BusConfig::default());
//! bus.consumer::<SimpleMessage, SimpleConsumer>()?;
//!
//! let handle = bus.start().await?;
//! let mut faults = bus.subscribe_faults();
//!
//! // ...
//! handle.stop(Some(Duration::from_secs(5))).await?;
//! ```

/// Consumer bindings (message type to consumer type)
pub mod binding;

/// Receive endpoint lifecycle
pub mod bus;

/// Bus configuration
pub mod config;

/// Fault broadcast channel
pub mod faults;

/// Per-message invocation state machine
pub mod invoker;

/// Prometheus metrics for observability
pub mod metrics;

/// Ordered observer notifications
pub mod observer_chain;

/// Error types for the bus lifecycle
pub mod error {
    use scopebus_core::{MessageId, TransportError};
    use thiserror::Error;

    /// Errors that can occur during bus operations
    ///
    /// `Clone` so every caller of `stop` can receive the same result.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum BusError {
        /// `start` was called on a bus that is not `Created`
        #[error("Bus has already been started")]
        AlreadyStarted,

        /// `stop` was called on a bus that was never started
        #[error("Bus has not been started")]
        NotStarted,

        /// A consumer or observer was registered after `start`
        #[error("Pipeline is frozen once the bus has started")]
        PipelineAlreadyStarted,

        /// A delivery was offered while the bus was not `Started`
        ///
        /// Returned by `dispatch` before start and once `stop` has begun.
        #[error("Bus is not accepting deliveries")]
        NotAccepting,

        /// Drain timed out with invocations still running
        ///
        /// The bus is stopped anyway; the abandoned invocations release their
        /// own scopes when they finish.
        #[error("Drain timed out with {abandoned} invocation(s) still running")]
        DrainTimeout {
            /// Invocations still running when the timeout elapsed
            abandoned: usize,
        },

        /// The transport failed to start receiving
        #[error("Transport error: {0}")]
        Transport(#[from] TransportError),

        /// The task consuming a dispatched delivery ended without an outcome
        #[error("Invocation of {message_id} aborted: {reason}")]
        InvocationAborted {
            /// Delivery that was being consumed
            message_id: MessageId,
            /// Why the task ended
            reason: String,
        },
    }
}

pub use binding::{BindingTable, ConsumerBinding, ConsumerPipe, ErasedConsumer};
pub use bus::{Bus, BusHandle, BusState};
pub use config::BusConfig;
pub use error::BusError;
pub use faults::{FaultChannel, FaultKind, FaultReport};
pub use invoker::{ConsumeStatus, ConsumerInvoker, DeliveryOutcome, InvocationState};
pub use observer_chain::ObserverChain;
