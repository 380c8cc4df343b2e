//! # Scopebus Core
//!
//! Core traits and types for scoped message consumption.
//!
//! Every inbound message is consumed inside its own [`ResourceScope`]: the consumer
//! and its dependencies are resolved from that scope, lifecycle observers are
//! notified around the consumer call, and the scope is closed afterwards so every
//! scope-bound resource is released whatever the outcome.
//!
//! ## Core Concepts
//!
//! - **Delivery**: raw message handed over by a [`Transport`]
//! - **ConsumeContext**: per-message envelope with a type-keyed payload bag
//! - **ResourceScope**: isolated resolution boundary, closed exactly once
//! - **Resolver**: builds instances within a scope ([`ServiceRegistry`] is the
//!   factory-registry implementation)
//! - **Consumer**: business logic for one message type
//! - **ConsumeObserver**: pre / post / fault lifecycle hooks
//!
//! The pipeline that ties these together lives in `scopebus-runtime`.
//!
//! ## Example
//!
//! ```ignore
//! use scopebus_core::prelude::*;
//!
//! struct SimpleConsumer {
//!     dependency: Arc<SimpleDependency>,
//! }
//!
//! impl Consumer<SimpleMessage> for SimpleConsumer {
//!     fn consume<'a>(&'a self, context: &'a ConsumeContext, message: &'a SimpleMessage) -> HandlerFuture<'a> {
//!         Box::pin(async move {
//!             self.dependency.do_something(&message.name).await;
//!             Ok(())
//!         })
//!     }
//! }
//!
//! let mut registry = ServiceRegistry::new();
//! registry
//!     .add_scoped_disposable(|_| Ok(SimpleDependency::default()))
//!     .add_transient(|scope| Ok(SimpleConsumer { dependency: scope.resolve()? }));
//! ```

pub mod consumer;
pub mod context;
pub mod error;
pub mod message;
pub mod observer;
pub mod payload;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod transport;

pub use consumer::{Consumer, HandlerError, HandlerFuture};
pub use context::ConsumeContext;
pub use error::{BoxError, ConsumeError, PanicError};
pub use message::{Delivery, Envelope, Message, MessageId, MessageType};
pub use observer::{ConsumeObserver, ObserverError, ObserverFailure, ObserverFuture, ObserverPhase};
pub use payload::{PayloadBag, PayloadError};
pub use registry::{Lifetime, ServiceRegistry};
pub use resolver::{Instance, Provided, ResolutionError, Resolver, TypeKey};
pub use scope::{
    AsyncDispose, DisposalFailure, DisposeFuture, ResourceScope, ScopeClosed, ScopeCloseError,
    ScopeDisposalError, ScopeFactory, ScopeId,
};
pub use transport::{DeliveryStream, Transport, TransportError};

/// Commonly used items for writing consumers, observers and registrations.
pub mod prelude {
    pub use crate::{
        AsyncDispose, BoxError, ConsumeContext, ConsumeError, ConsumeObserver, Consumer, Delivery,
        DisposeFuture, HandlerError, HandlerFuture, Message, ObserverError, ObserverFuture,
        ResolutionError, ResourceScope, ServiceRegistry,
    };
    pub use std::sync::Arc;
}
