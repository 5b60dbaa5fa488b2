//! # Service Coordinator
//!
//! Service bindings are recorded on container values; nothing runs until a
//! consumer forces evaluation. At force time the engine asks the
//! coordinator for a lease on every service the evaluation depends on: the
//! first lease on a service starts it (at most once per service ID), later
//! leases share the instance, and releasing the last lease tears the
//! instance down together with the leases it holds on its own dependency
//! services.
//!
//! Bookkeeping lives behind a per-service async mutex so independent
//! services start and stop concurrently; the map-level lock is only held to
//! look up the slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BuildBackend, RunningService};
use crate::error::Result;
use crate::ident::ContainerId;

/// The alias-resolvable hostname of a service container.
///
/// Derived from the container ID, so it is stable for a given ID within and
/// across processes.
pub(crate) fn service_hostname(id: &ContainerId) -> String {
    format!("svc-{}", &id.digest()[..12])
}

/// A held reference to a running service instance.
///
/// Leases are handed back to [`ServiceCoordinator::release`] when the
/// consuming evaluation completes; dropping one unreleased leaks the
/// reference (and a warning) rather than tearing down a service from a
/// non-async context.
#[derive(Debug)]
pub(crate) struct ServiceLease {
    key: String,
    pub(crate) hostname: String,
    released: bool,
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(service = %self.key, "service lease dropped without release");
        }
    }
}

#[derive(Default)]
struct ServiceSlot {
    refcount: usize,
    running: Option<RunningService>,
    /// Leases this service holds on its own dependencies, released when
    /// the instance is torn down.
    deps: Vec<ServiceLease>,
}

/// Reference-counts and lifecycles service instances.
pub(crate) struct ServiceCoordinator {
    backend: Arc<dyn BuildBackend>,
    slots: StdMutex<HashMap<String, Arc<Mutex<ServiceSlot>>>>,
}

impl ServiceCoordinator {
    pub(crate) fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self {
            backend,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<ServiceSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Acquires a lease on the service identified by `id`, starting it via
    /// `start` if no instance is running. `start` returns the running
    /// instance plus the leases it took on dependency services.
    pub(crate) async fn acquire<F, Fut>(&self, id: &ContainerId, start: F) -> Result<ServiceLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(RunningService, Vec<ServiceLease>)>>,
    {
        let key = id.digest();
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if guard.running.is_none() {
            let (running, deps) = start().await?;
            info!(hostname = %running.hostname, "service started");
            guard.running = Some(running);
            guard.deps = deps;
        }

        guard.refcount += 1;
        let hostname = guard
            .running
            .as_ref()
            .map(|r| r.hostname.clone())
            .unwrap_or_default();
        debug!(service = %key, refcount = guard.refcount, "service lease acquired");

        Ok(ServiceLease {
            key,
            hostname,
            released: false,
        })
    }

    /// Releases a lease; the last release tears the instance down and
    /// recursively releases its dependency leases.
    pub(crate) async fn release(&self, mut lease: ServiceLease) -> Result<()> {
        lease.released = true;
        let slot = self.slot(&lease.key);
        let mut guard = slot.lock().await;

        guard.refcount = guard.refcount.saturating_sub(1);
        debug!(service = %lease.key, refcount = guard.refcount, "service lease released");
        if guard.refcount > 0 {
            return Ok(());
        }

        let running = guard.running.take();
        let deps = std::mem::take(&mut guard.deps);
        drop(guard);

        if let Some(running) = running {
            info!(hostname = %running.hostname, "service stopped");
            self.backend.stop_service(&running).await?;
        }
        for dep in deps {
            Box::pin(self.release(dep)).await?;
        }
        Ok(())
    }

    /// True when at least one live lease holds the service running.
    pub(crate) async fn is_running(&self, id: &ContainerId) -> bool {
        let slot = self.slot(&id.digest());
        let guard = slot.lock().await;
        guard.running.is_some()
    }
}
