//! Per-invocation service lookup.
//!
//! Handlers should not hold long-lived singletons; instead each handler
//! invocation opens a short-lived [`ServiceScope`] from the consumer's
//! [`ServiceRegistry`] and drops it on return. The scope also carries the
//! swimlane's cancellation token so cooperating handlers can observe a
//! cancel-current shutdown.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

type ServiceFactory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Registry of service factories keyed by type.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<TypeId, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a fresh `T` per scope.
    pub fn provide<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>),
        );
        self
    }

    /// Register a shared instance handed to every scope.
    pub fn provide_instance<T>(mut self, instance: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Arc::new(move || Arc::clone(&instance) as Arc<dyn Any + Send + Sync>),
        );
        self
    }

    /// Instantiate every registered service for one handler invocation.
    pub fn open_scope(&self, cancellation: CancellationToken) -> ServiceScope {
        let services = self
            .factories
            .iter()
            .map(|(type_id, factory)| (*type_id, factory()))
            .collect();
        ServiceScope {
            services,
            cancellation,
        }
    }
}

/// Services resolved for a single handler invocation.
#[derive(Clone)]
pub struct ServiceScope {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    cancellation: CancellationToken,
}

impl ServiceScope {
    /// Scope with no services, used where no registry is configured.
    pub fn empty(cancellation: CancellationToken) -> Self {
        Self {
            services: HashMap::new(),
            cancellation,
        }
    }

    /// Look up a service by type.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Token cancelled when the swimlane is stopped in cancel-current mode.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
