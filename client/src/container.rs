//! Dependency container for managed services.
//!
//! Each registered type gets a factory and a once-cell. Resolving a type
//! constructs and initializes at most one instance even under concurrent
//! callers; a failed initialization leaves the cell empty so the next
//! resolve starts from a fresh instance.
//!
//! Every top-level `resolve` is one resolution. The container records which
//! resolution is initializing each type and which type each resolution is
//! waiting on. Before a resolution waits on a type, it follows those records;
//! if they lead back to a type it is initializing itself, the resolve fails
//! with `DependencyCycle`, whether the cycle lies within one task or spans
//! several.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;

use crate::{error::ServiceError, lifecycle::ManagedService};

type Factory = Box<dyn Fn() -> Result<Entry, ServiceError> + Send + Sync>;

type Chain = [(TypeId, &'static str)];

#[derive(Clone)]
struct Entry {
    instance: Arc<dyn Any + Send + Sync>,
    service:  Arc<dyn ManagedService>,
}

struct Registration {
    name:    &'static str,
    factory: Factory,
    cell:    Mutex<Arc<OnceCell<Entry>>>,
}

#[derive(Default)]
struct InFlight {
    // Type -> (resolution initializing it, its name)
    owners:  HashMap<TypeId, (u64, &'static str)>,
    // Resolution -> type it is waiting on
    waiting: HashMap<u64, TypeId>,
}

impl InFlight {
    /// Follow owner and waiting records from `target`. When they reach a
    /// type owned by `resolution`, return the names walked and that type.
    fn cycle_through(&self, resolution: u64, target: TypeId) -> Option<(Vec<&'static str>, TypeId)> {
        let mut walked = Vec::new();
        let mut current = target;

        for _ in 0..=self.owners.len() {
            let &(owner, name) = self.owners.get(&current)?;
            if owner == resolution {
                return Some((walked, current));
            }
            walked.push(name);
            current = *self.waiting.get(&owner)?;
        }
        None
    }
}

/// Registry of service factories and their live singletons
#[derive(Default)]
pub struct ServiceContainer {
    registrations:   RwLock<HashMap<TypeId, Arc<Registration>>>,
    // Services in the order they became ready
    ready_order:     Mutex<Vec<Arc<dyn ManagedService>>>,
    in_flight:       Mutex<InFlight>,
    next_resolution: AtomicU64,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `S`, replacing any earlier one.
    /// Construction is cheap; setup belongs in `initialize()`.
    pub fn register<S, F>(&self, factory: F)
    where
        S: ManagedService,
        F: Fn() -> Result<S, ServiceError> + Send + Sync + 'static,
    {
        let factory: Factory = Box::new(move || {
            let service = Arc::new(factory()?);
            Ok(Entry {
                instance: service.clone(),
                service,
            })
        });
        let registration = Registration {
            name: type_name::<S>(),
            factory,
            cell: Mutex::new(Arc::new(OnceCell::new())),
        };

        let previous = self
            .registrations
            .write()
            .insert(TypeId::of::<S>(), Arc::new(registration));
        if previous.is_some() {
            tracing::warn!(service = type_name::<S>(), "Replacing existing registration");
        }
    }

    pub fn is_registered<S: ManagedService>(&self) -> bool {
        self.registrations.read().contains_key(&TypeId::of::<S>())
    }

    /// Return the ready singleton for `S`, constructing and initializing it
    /// (and, through it, its dependencies) on first use.
    pub async fn resolve<S: ManagedService>(&self) -> Result<Arc<S>, ServiceError> {
        self.resolve_in::<S>(self.new_resolution(), &[]).await
    }

    fn new_resolution(&self) -> u64 {
        self.next_resolution.fetch_add(1, Ordering::Relaxed)
    }

    async fn resolve_in<S: ManagedService>(
        &self,
        resolution: u64,
        chain: &Chain,
    ) -> Result<Arc<S>, ServiceError> {
        let type_id = TypeId::of::<S>();

        if let Some(start) = chain.iter().position(|(id, _)| *id == type_id) {
            let mut cycle: Vec<&'static str> = chain[start..].iter().map(|(_, name)| *name).collect();
            cycle.push(type_name::<S>());
            return Err(cycle_error(cycle));
        }

        let registration = self
            .registrations
            .read()
            .get(&type_id)
            .cloned()
            .ok_or(ServiceError::NotRegistered(type_name::<S>()))?;
        let cell = registration.cell.lock().clone();

        if let Some(entry) = cell.get() {
            return downcast(entry);
        }

        let _waiting = self.begin_wait(resolution, type_id, chain)?;

        let entry = cell
            .get_or_try_init(|| async {
                let _owner = self.take_ownership(resolution, type_id, registration.name);

                tracing::debug!(service = registration.name, "Constructing service");
                let entry = (registration.factory)()?;

                let mut next = chain.to_vec();
                next.push((type_id, registration.name));
                let resolver = Resolver {
                    container: self,
                    resolution,
                    chain: next,
                };
                entry.service.initialize(&resolver).await?;

                let current = {
                    let mut ready = self.ready_order.lock();
                    let current = Arc::ptr_eq(&*registration.cell.lock(), &cell);
                    if current {
                        ready.push(entry.service.clone());
                    }
                    current
                };
                if !current {
                    tracing::warn!(service = registration.name, "Container shut down during initialization");
                    if let Err(e) = entry.service.shutdown().await {
                        tracing::warn!(service = registration.name, "Release after shutdown race failed: {}", e);
                    }
                    return Err(ServiceError::Initialization {
                        service: registration.name.to_string(),
                        reason:  "container shut down during initialization".into(),
                    });
                }
                Ok::<_, ServiceError>(entry)
            })
            .await?;

        downcast(entry)
    }

    /// Record that `resolution` is about to wait on `type_id`, failing
    /// instead when the wait would close a cycle
    fn begin_wait(&self, resolution: u64, type_id: TypeId, chain: &Chain) -> Result<WaitGuard<'_>, ServiceError> {
        let mut in_flight = self.in_flight.lock();

        if let Some((walked, closing)) = in_flight.cycle_through(resolution, type_id) {
            let mut cycle: Vec<&'static str> = match chain.iter().position(|(id, _)| *id == closing) {
                Some(start) => chain[start..].iter().map(|(_, name)| *name).collect(),
                None => Vec::new(),
            };
            cycle.extend(walked);
            if let Some(&first) = cycle.first() {
                cycle.push(first);
            }
            return Err(cycle_error(cycle));
        }

        in_flight.waiting.insert(resolution, type_id);
        Ok(WaitGuard {
            container: self,
            resolution,
            type_id,
        })
    }

    /// `resolution` won the once-cell for `type_id`: it stops waiting and
    /// becomes the initializing owner
    fn take_ownership(&self, resolution: u64, type_id: TypeId, name: &'static str) -> OwnerGuard<'_> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.waiting.get(&resolution) == Some(&type_id) {
            in_flight.waiting.remove(&resolution);
        }
        in_flight.owners.insert(type_id, (resolution, name));
        OwnerGuard {
            container: self,
            resolution,
            type_id,
        }
    }

    /// Number of live (ready) services
    pub fn len(&self) -> usize {
        self.ready_order.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every live service in reverse order of readiness.
    ///
    /// All services are attempted; failures are collected into a single
    /// `ServiceError::Shutdown`. The container is empty afterwards.
    pub async fn shutdown_all(&self) -> Result<(), ServiceError> {
        let services = {
            let registrations = self.registrations.read();
            let mut ready = self.ready_order.lock();
            for registration in registrations.values() {
                *registration.cell.lock() = Arc::new(OnceCell::new());
            }
            std::mem::take(&mut *ready)
        };
        tracing::info!("Shutting down {} service(s)", services.len());

        let mut failures = Vec::new();
        for service in services.into_iter().rev() {
            if let Err(err) = service.shutdown().await {
                tracing::error!(service = service.identifier(), "Shutdown failed: {}", err);
                failures.push(err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Shutdown(failures))
        }
    }
}

fn cycle_error(cycle: Vec<&'static str>) -> ServiceError {
    tracing::error!("Dependency cycle: {}", cycle.join(" -> "));
    ServiceError::DependencyCycle(cycle)
}

fn downcast<S: ManagedService>(entry: &Entry) -> Result<Arc<S>, ServiceError> {
    entry.instance.clone().downcast::<S>().map_err(|_| {
        ServiceError::Configuration(format!(
            "registration for {} produced a different type",
            type_name::<S>()
        ))
    })
}

struct WaitGuard<'a> {
    container:  &'a ServiceContainer,
    resolution: u64,
    type_id:    TypeId,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.container.in_flight.lock();
        if in_flight.waiting.get(&self.resolution) == Some(&self.type_id) {
            in_flight.waiting.remove(&self.resolution);
        }
    }
}

struct OwnerGuard<'a> {
    container:  &'a ServiceContainer,
    resolution: u64,
    type_id:    TypeId,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.container.in_flight.lock();
        if in_flight.owners.get(&self.type_id).map(|(owner, _)| *owner) == Some(self.resolution) {
            in_flight.owners.remove(&self.type_id);
        }
    }
}

/// Handed to `initialize()` so a service can resolve its dependencies.
///
/// Carries the resolution it belongs to and the chain of types that
/// resolution is initializing. Dependencies are resolved one at a time.
pub struct Resolver<'a> {
    container:  &'a ServiceContainer,
    resolution: u64,
    chain:      Vec<(TypeId, &'static str)>,
}

impl<'a> Resolver<'a> {
    /// Resolver with an empty chain, for initializing services by hand
    #[cfg(test)]
    pub(crate) fn for_tests(container: &'a ServiceContainer) -> Self {
        Self {
            container,
            resolution: container.new_resolution(),
            chain: Vec::new(),
        }
    }

    pub async fn resolve<S: ManagedService>(&self) -> Result<Arc<S>, ServiceError> {
        self.container.resolve_in::<S>(self.resolution, &self.chain).await
    }
}
