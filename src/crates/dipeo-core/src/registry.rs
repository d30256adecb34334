//! Typed service registry.
//!
//! [`ServiceKey<T>`] is a nominal, hashable key carrying the service type as
//! a phantom parameter, so consumers resolve a statically known interface
//! instead of doing stringly-typed lookups. The registry is append-mostly at
//! startup and effectively read-only during execution; per-item isolation for
//! batch runs goes through [`ServiceRegistry::create_child`] (copy-on-write,
//! parent lookups on miss) or [`ServiceRegistry::isolated_clone`] (flattened
//! copy with no parent link).
//!
//! Factories registered with [`ServiceRegistry::register_factory`] are
//! materialized lazily exactly once. Resolved key names are recorded so
//! [`ServiceRegistry::report_unused`] can flag dead wiring after startup.

use crate::error::{DipeoError, Result};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// A nominal, typed key into the registry.
///
/// Two keys are interchangeable iff their names are equal; the type parameter
/// exists purely to make `resolve` type-safe.
pub struct ServiceKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ServiceKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

// Manual impls: derives would bound `T`.
impl<T> Clone for ServiceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ServiceKey<T> {}

impl<T> std::fmt::Debug for ServiceKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceKey({})", self.name)
    }
}

type BoxedService = Arc<dyn Any + Send + Sync>;
type ServiceFactory = Box<dyn Fn() -> BoxedService + Send + Sync>;

enum Entry {
    Instance(BoxedService),
    Factory(ServiceFactory),
}

/// Typed key -> service container with child scopes.
#[derive(Default)]
pub struct ServiceRegistry {
    parent: Option<Arc<ServiceRegistry>>,
    entries: RwLock<HashMap<&'static str, Entry>>,
    resolved: Mutex<HashSet<&'static str>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service instance under `key`, replacing any previous entry.
    ///
    /// `T` is the resolved value type - typically an `Arc<dyn Trait>`.
    pub fn register<T: Clone + Send + Sync + 'static>(&self, key: ServiceKey<T>, service: T) {
        self.entries
            .write()
            .insert(key.name, Entry::Instance(Arc::new(service)));
    }

    /// Register a factory that is materialized lazily on first resolve.
    pub fn register_factory<T, F>(&self, key: ServiceKey<T>, factory: F)
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.entries.write().insert(
            key.name,
            Entry::Factory(Box::new(move || Arc::new(factory()) as BoxedService)),
        );
    }

    /// Resolve a service by typed key, raising on missing or mistyped
    /// entries. Records the key for the unused-wiring report.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self, key: ServiceKey<T>) -> Result<T> {
        self.resolved.lock().insert(key.name);

        // Fast path: existing instance in this scope.
        if let Some(Entry::Instance(boxed)) = self.entries.read().get(key.name) {
            return downcast::<T>(key, boxed);
        }

        // Factory: materialize once, replacing the entry.
        {
            let mut entries = self.entries.write();
            if let Some(Entry::Factory(_)) = entries.get(key.name) {
                let Some(Entry::Factory(factory)) = entries.remove(key.name) else {
                    unreachable!()
                };
                let boxed = factory();
                let value = downcast::<T>(key, &boxed)?;
                entries.insert(key.name, Entry::Instance(boxed));
                return Ok(value);
            }
        }

        match &self.parent {
            Some(parent) => parent.resolve(key),
            None => Err(DipeoError::service_resolution(key.name)),
        }
    }

    /// Whether `key` is registered in this scope or any parent.
    pub fn has<T>(&self, key: ServiceKey<T>) -> bool {
        if self.entries.read().contains_key(key.name) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.has(key))
    }

    /// Create a copy-on-write child scope. Lookups fall back to the parent;
    /// overrides never propagate back.
    pub fn create_child(self: &Arc<Self>) -> ServiceRegistry {
        ServiceRegistry {
            parent: Some(self.clone()),
            entries: RwLock::new(HashMap::new()),
            resolved: Mutex::new(HashSet::new()),
        }
    }

    /// Flatten this registry (including parents) into a standalone copy.
    ///
    /// Services are copied by reference (the `Arc`s are shared); what is
    /// isolated is the container, so per-item registrations during a batch
    /// run cannot contaminate siblings. Pending factories are not carried
    /// over - materialize them first if the child needs them.
    pub fn isolated_clone(&self) -> ServiceRegistry {
        let fresh = ServiceRegistry::new();
        let mut scope = Some(self);
        let mut seen: HashSet<&'static str> = HashSet::new();
        while let Some(reg) = scope {
            for (name, entry) in reg.entries.read().iter() {
                if let Entry::Instance(boxed) = entry {
                    if seen.insert(name) {
                        fresh
                            .entries
                            .write()
                            .insert(name, Entry::Instance(boxed.clone()));
                    }
                }
            }
            scope = reg.parent.as_deref();
        }
        fresh
    }

    /// Keys registered in this scope that were never resolved.
    pub fn report_unused(&self) -> Vec<&'static str> {
        let resolved = self.resolved.lock();
        let mut unused: Vec<&'static str> = self
            .entries
            .read()
            .keys()
            .filter(|name| !resolved.contains(**name))
            .copied()
            .collect();
        unused.sort_unstable();
        unused
    }
}

fn downcast<T: Clone + 'static>(key: ServiceKey<T>, boxed: &BoxedService) -> Result<T> {
    boxed
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| DipeoError::service_resolution(key.name))
}
