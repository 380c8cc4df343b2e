//! Factory-registry resolver.
//!
//! [`ServiceRegistry`] maps a type to a factory and a [`Lifetime`]:
//!
//! - [`Lifetime::Transient`]: a fresh instance on every resolution
//! - [`Lifetime::Scoped`]: one instance per [`ResourceScope`]
//! - [`Lifetime::Singleton`]: one instance for the whole process, owned by the
//!   registry and released by [`Resolver::release`]
//!
//! Factories receive the resolving scope and pull their own dependencies from it,
//! so a consumer's dependency graph is built lazily and entirely inside the
//! message's scope.
//!
//! # Example
//!
//! ```
//! use scopebus_core::registry::ServiceRegistry;
//! use std::sync::Arc;
//!
//! struct Repository;
//! struct OrderService {
//!     repository: Arc<Repository>,
//! }
//!
//! let mut registry = ServiceRegistry::new();
//! registry
//!     .add_scoped(|_| Ok(Repository))
//!     .add_transient(|scope| {
//!         Ok(OrderService {
//!             repository: scope.resolve::<Repository>()?,
//!         })
//!     });
//!
//! assert!(registry.contains::<OrderService>());
//! ```

use crate::resolver::{Instance, Provided, ResolutionError, Resolver, TypeKey};
use crate::scope::{
    AsyncDispose, DisposeFuture, ResourceScope, ScopeClosed, ScopeDisposalError, ScopeId, Tracked,
    dispose_in_reverse,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How long a resolved instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// New instance per resolution
    Transient,
    /// One instance per scope
    Scoped,
    /// One instance per registry
    Singleton,
}

type Factory = Arc<dyn Fn(&ResourceScope) -> Result<Provided, ResolutionError> + Send + Sync>;

struct Registration {
    lifetime: Lifetime,
    factory: Factory,
}

#[derive(Default)]
struct Singletons {
    instances: HashMap<TypeKey, Instance>,
    tracked: Vec<Tracked>,
}

/// Resolver backed by registered factories.
#[derive(Default)]
pub struct ServiceRegistry {
    registrations: HashMap<TypeKey, Registration>,
    singletons: Mutex<Singletons>,
    released: AtomicBool,
}

impl ServiceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `T` with the given lifetime
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register<T, F>(&mut self, lifetime: Lifetime, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.insert::<T>(
            lifetime,
            Arc::new(move |scope| factory(scope).map(|value| Provided::new(Arc::new(value)))),
        )
    }

    /// Register a factory for a `T` whose release hook runs when its owner closes
    pub fn register_disposable<T, F>(&mut self, lifetime: Lifetime, factory: F) -> &mut Self
    where
        T: AsyncDispose,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.insert::<T>(
            lifetime,
            Arc::new(move |scope| factory(scope).map(|value| Provided::disposable(Arc::new(value)))),
        )
    }

    /// Register a per-resolution factory
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register(Lifetime::Transient, factory)
    }

    /// Register a scope-local singleton factory
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register(Lifetime::Scoped, factory)
    }

    /// Register a process-wide singleton factory
    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register(Lifetime::Singleton, factory)
    }

    /// Register a disposable per-resolution factory
    pub fn add_transient_disposable<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: AsyncDispose,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register_disposable(Lifetime::Transient, factory)
    }

    /// Register a disposable scope-local singleton factory
    pub fn add_scoped_disposable<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: AsyncDispose,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register_disposable(Lifetime::Scoped, factory)
    }

    /// Register a disposable process-wide singleton factory
    pub fn add_singleton_disposable<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: AsyncDispose,
        F: Fn(&ResourceScope) -> Result<T, ResolutionError> + Send + Sync + 'static,
    {
        self.register_disposable(Lifetime::Singleton, factory)
    }

    /// Register an existing instance as a singleton
    ///
    /// The registry does not dispose instances it did not create.
    pub fn add_instance<T>(&mut self, instance: Arc<T>) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.insert::<T>(
            Lifetime::Singleton,
            Arc::new(move |_| Ok(Provided::new(Arc::clone(&instance)))),
        )
    }

    /// Whether `T` is registered
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeKey::of::<T>())
    }

    /// Lifetime registered for `T`
    #[must_use]
    pub fn lifetime_of<T: 'static>(&self) -> Option<Lifetime> {
        self.registrations.get(&TypeKey::of::<T>()).map(|r| r.lifetime)
    }

    /// Number of registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn insert<T: 'static>(&mut self, lifetime: Lifetime, factory: Factory) -> &mut Self {
        let key = TypeKey::of::<T>();
        if self
            .registrations
            .insert(key, Registration { lifetime, factory })
            .is_some()
        {
            tracing::debug!(type_name = key.name(), "Replaced registration");
        }
        self
    }

    fn singleton(
        &self,
        scope: &ResourceScope,
        key: &TypeKey,
        factory: &Factory,
    ) -> Result<Instance, ResolutionError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ScopeClosed { scope_id: ScopeId::ROOT }.into());
        }
        if let Some(existing) = self.lock_singletons().instances.get(key) {
            return Ok(Arc::clone(existing));
        }

        let provided = factory(scope)?;

        let mut singletons = self.lock_singletons();
        if let Some(existing) = singletons.instances.get(key) {
            // Lost a creation race; the duplicate is released with the root.
            let existing = Arc::clone(existing);
            if let Some(disposer) = provided.disposer {
                singletons.tracked.push(Tracked { type_name: provided.type_name, disposer });
            }
            return Ok(existing);
        }

        if let Some(disposer) = &provided.disposer {
            singletons.tracked.push(Tracked {
                type_name: provided.type_name,
                disposer: Arc::clone(disposer),
            });
        }
        singletons.instances.insert(*key, Arc::clone(&provided.instance));
        tracing::debug!(type_name = key.name(), "Created singleton");
        Ok(provided.instance)
    }

    fn lock_singletons(&self) -> MutexGuard<'_, Singletons> {
        self.singletons.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Resolver for ServiceRegistry {
    fn resolve(&self, scope: &ResourceScope, key: &TypeKey) -> Result<Instance, ResolutionError> {
        let registration = self
            .registrations
            .get(key)
            .ok_or(ResolutionError::NotRegistered { type_name: key.name() })?;

        match registration.lifetime {
            Lifetime::Transient => scope.track((registration.factory)(scope)?),
            Lifetime::Scoped => scope.scoped_instance(key, || (registration.factory)(scope)),
            Lifetime::Singleton => self.singleton(scope, key, &registration.factory),
        }
    }

    fn release(&self) -> DisposeFuture<'_, Result<(), ScopeDisposalError>> {
        Box::pin(async move {
            if self.released.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let Singletons { instances, tracked } = std::mem::take(&mut *self.lock_singletons());
            tracing::debug!(singletons = instances.len(), disposables = tracked.len(), "Releasing root singletons");

            let result = dispose_in_reverse(ScopeId::ROOT, tracked).await;
            drop(instances);
            result
        })
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("registrations", &self.registrations.len())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
