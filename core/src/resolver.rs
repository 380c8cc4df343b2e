//! Resolver abstraction the pipeline resolves consumers through.
//!
//! The pipeline never knows how instances are built. It only asks a
//! [`Resolver`] for an instance of a [`TypeKey`] within a
//! [`ResourceScope`]. A resolver honours two lifetimes on top of that call:
//!
//! - **scope-local singleton**: one instance per scope, stored with
//!   [`ResourceScope::scoped_instance`]
//! - **per-resolution**: a fresh instance on every call, registered for disposal
//!   with [`ResourceScope::track`]
//!
//! [`ServiceRegistry`](crate::registry::ServiceRegistry) is the factory-registry
//! implementation shipped with this crate.

use crate::error::BoxError;
use crate::scope::{AsyncDispose, DisposeFuture, ResourceScope, ScopeClosed, ScopeDisposalError};
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// A type-erased resolved instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Type identity used as the resolution key.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key for type `T`
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Type name, for diagnostics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An instance produced by a factory, with its optional release hook.
pub struct Provided {
    pub(crate) type_name: &'static str,
    pub(crate) instance: Instance,
    pub(crate) disposer: Option<Arc<dyn AsyncDispose>>,
}

impl Provided {
    /// An instance with no release hook
    #[must_use]
    pub fn new<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            type_name: type_name::<T>(),
            instance: value,
            disposer: None,
        }
    }

    /// An instance released through its [`AsyncDispose`] impl when its owner closes
    #[must_use]
    pub fn disposable<T: AsyncDispose>(value: Arc<T>) -> Self {
        let disposer: Arc<dyn AsyncDispose> = Arc::clone(&value) as Arc<dyn AsyncDispose>;
        Self {
            type_name: type_name::<T>(),
            instance: value,
            disposer: Some(disposer),
        }
    }

    /// The type-erased instance
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl fmt::Debug for Provided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provided")
            .field("type_name", &self.type_name)
            .field("disposable", &self.disposer.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors raised while resolving an instance from a scope.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// Nothing is registered for the requested type
    #[error("No registration for {type_name}")]
    NotRegistered {
        /// Requested type
        type_name: &'static str,
    },

    /// The scope was closed before or during resolution
    #[error(transparent)]
    ScopeClosed(#[from] ScopeClosed),

    /// The type depends on itself, directly or transitively
    #[error("Circular dependency: {}", chain.join(" -> "))]
    Circular {
        /// Resolution chain, ending with the repeated type
        chain: Vec<&'static str>,
    },

    /// The resolved instance is not of the requested type
    #[error("Instance registered for {type_name} has a different type")]
    TypeMismatch {
        /// Requested type
        type_name: &'static str,
    },

    /// A factory failed while building the instance
    #[error("Factory for {type_name} failed: {source}")]
    Factory {
        /// Type being built
        type_name: &'static str,
        /// Factory error
        #[source]
        source: BoxError,
    },
}

impl ResolutionError {
    /// Wrap a factory failure for type `T`
    #[must_use]
    pub fn factory<T: ?Sized + 'static>(source: impl Into<BoxError>) -> Self {
        Self::Factory {
            type_name: type_name::<T>(),
            source: source.into(),
        }
    }
}

/// Capability that builds instances within a scope.
///
/// Implementations are shared read-only by every concurrent invocation; all
/// per-message state lives in the [`ResourceScope`] passed to [`Resolver::resolve`].
///
/// # Dyn Compatibility
///
/// `release` returns an explicit boxed future so the trait can be used as
/// `Arc<dyn Resolver>`.
pub trait Resolver: Send + Sync + 'static {
    /// Resolve the instance registered for `key` within `scope`
    ///
    /// Implementations resolve dependencies by calling back into
    /// [`ResourceScope::resolve`] on the same scope.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] when the type is unknown or cannot be built.
    fn resolve(&self, scope: &ResourceScope, key: &TypeKey) -> Result<Instance, ResolutionError>;

    /// Release root-owned (process-wide singleton) instances
    ///
    /// Called once by the bus after the last scope has been closed.
    fn release(&self) -> DisposeFuture<'_, Result<(), ScopeDisposalError>> {
        Box::pin(std::future::ready(Ok(())))
    }
}
