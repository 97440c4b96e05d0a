use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sandbox::{ContainerRuntime, InstanceId, SandboxError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound on a single forced removal.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A created and started sandbox instance that nobody has used yet.
#[derive(Debug)]
#[must_use]
pub struct SandboxInstance {
    id: InstanceId,
    created_at: Instant,
}

impl SandboxInstance {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// How long the instance has existed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Removes instances through the runtime and counts how many it destroyed.
pub(crate) struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    destroyed: AtomicU64,
}

impl Reaper {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            destroyed: AtomicU64::new(0),
        }
    }

    pub(crate) fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Remove `instance` on a task of its own and wait for it. The removal
    /// carries on even if the caller's future is dropped mid-way.
    pub(crate) async fn destroy(self: &Arc<Self>, instance: SandboxInstance) {
        let reaper = Arc::clone(self);
        let id = instance.id.clone();
        let removal = tokio::spawn(async move { reaper.destroy_now(instance).await });
        if let Err(e) = removal.await {
            error!(id = %id, error = %e, "instance removal task failed");
        }
    }

    /// Remove every instance in `instances` on one task and wait for it.
    pub(crate) async fn destroy_all(self: &Arc<Self>, instances: Vec<SandboxInstance>) {
        let reaper = Arc::clone(self);
        let removal = tokio::spawn(async move {
            for instance in instances {
                reaper.destroy_now(instance).await;
            }
        });
        if let Err(e) = removal.await {
            error!(error = %e, "instance removal task failed");
        }
    }

    async fn destroy_now(&self, instance: SandboxInstance) {
        let age_ms = instance.age().as_millis() as u64;
        self.remove(&instance.id).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(id = %instance.id, age_ms, "instance destroyed");
    }

    /// Force-remove by id, bounded by [`REMOVE_TIMEOUT`]. Failures are
    /// logged, never returned: there is nothing a caller could do about them.
    pub(crate) async fn remove(&self, id: &InstanceId) {
        match tokio::time::timeout(REMOVE_TIMEOUT, self.runtime.remove_instance(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(SandboxError::NotFound(_))) => {
                debug!(id = %id, "instance already gone");
            }
            Ok(Err(e)) => error!(id = %id, error = %e, "failed to remove instance"),
            Err(_) => error!(
                id = %id,
                timeout_secs = REMOVE_TIMEOUT.as_secs(),
                "instance removal timed out"
            ),
        }
    }
}

/// Exclusive, single-use ownership of one pooled instance.
///
/// [`release`](Self::release) removes the instance. A lease dropped without
/// being released (early return, panic, cancelled future) schedules the same
/// removal on the current runtime, so every leased instance is destroyed
/// exactly once and none ever goes back to the pool.
#[must_use]
pub struct Lease {
    id: InstanceId,
    instance: Option<SandboxInstance>,
    reaper: Arc<Reaper>,
}

impl Lease {
    pub(crate) fn new(instance: SandboxInstance, reaper: Arc<Reaper>) -> Self {
        Self {
            id: instance.id.clone(),
            instance: Some(instance),
            reaper,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Destroy the instance and wait for the removal to finish. Dropping
    /// this future early does not cancel the removal.
    pub async fn release(mut self) {
        if let Some(instance) = self.instance.take() {
            self.reaper.destroy(instance).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(id = %self.id, "lease dropped without release, removing in background");
                let reaper = Arc::clone(&self.reaper);
                handle.spawn(async move { reaper.destroy_now(instance).await });
            }
            Err(_) => {
                error!(id = %self.id, "lease dropped outside a tokio runtime, instance leaked");
            }
        }
    }
}
