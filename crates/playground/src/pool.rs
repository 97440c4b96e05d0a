//! Warm pool of sandbox instances.
//!
//! A single background task keeps up to `capacity` created-and-started
//! instances buffered so that [`Pool::acquire`] rarely waits on container
//! startup. Instances leave the pool exactly once, wrapped in a [`Lease`],
//! and are never put back after use.
//!
//! Waiters are served strictly in arrival order: a caller that finds the
//! buffer empty takes a ticket and the replenisher hands each fresh instance
//! to the oldest live ticket before it considers the buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sandbox::{ContainerRuntime, InstanceSpec, SandboxError};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::lease::{Lease, Reaper, SandboxInstance};
use crate::retry::RetryState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Budget for one create+start attempt.
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Re-check interval while the buffer is full.
const FULL_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// First retry delay after a failed creation.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Ceiling for the retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Consecutive creation failures before the pool reports itself degraded.
const BREAKER_THRESHOLD: u32 = 5;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for creating a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of idle instances to keep ready.
    pub capacity: usize,
    /// Spec every instance is created from.
    pub spec: InstanceSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    /// Instance creation keeps failing; retries continue at the capped delay.
    Degraded,
    Stopped,
}

/// Point-in-time view of the pool, for logs and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub ready: usize,
    pub capacity: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
    pub consecutive_failures: u32,
    pub health: PoolHealth,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<SandboxInstance>,
}

struct PoolState {
    ready: VecDeque<SandboxInstance>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
    created: u64,
    consecutive_failures: u32,
    degraded: bool,
}

/// Outcome of offering an instance to the waiters and the buffer.
enum Placement {
    Handed,
    Buffered,
    Rejected(SandboxInstance),
}

impl PoolState {
    /// Give `instance` to the oldest live waiter, else buffer it if there is
    /// room. `front` puts it at the head of the buffer (used for instances
    /// that were handed out but never taken).
    fn place(&mut self, mut instance: SandboxInstance, capacity: usize, front: bool) -> Placement {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(instance) {
                Ok(()) => return Placement::Handed,
                // Receiver gone; try the next ticket.
                Err(back) => instance = back,
            }
        }
        if self.ready.len() >= capacity {
            return Placement::Rejected(instance);
        }
        if front {
            self.ready.push_front(instance);
        } else {
            self.ready.push_back(instance);
        }
        Placement::Buffered
    }
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    reaper: Arc<Reaper>,
    spec: InstanceSpec,
    capacity: usize,
    state: Mutex<PoolState>,
    /// Signalled whenever an instance leaves the buffer.
    vacancy: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(&self, instance: SandboxInstance) -> Lease {
        Lease::new(instance, Arc::clone(&self.reaper))
    }

    fn is_full(&self) -> bool {
        self.state().ready.len() >= self.capacity
    }

    /// Create and start one instance within [`CREATE_TIMEOUT`]. A container
    /// that was created but failed to start is removed before returning.
    async fn provision(&self) -> sandbox::Result<SandboxInstance> {
        let deadline = Instant::now() + CREATE_TIMEOUT;
        let timed_out = |operation| SandboxError::Timeout {
            operation,
            seconds: CREATE_TIMEOUT.as_secs(),
        };

        let id = tokio::time::timeout_at(deadline, self.runtime.create_instance(&self.spec))
            .await
            .map_err(|_| timed_out("create"))??;

        let started = tokio::time::timeout_at(deadline, self.runtime.start_instance(&id))
            .await
            .map_err(|_| timed_out("start"))
            .and_then(|r| r);
        if let Err(e) = started {
            self.reaper.remove(&id).await;
            return Err(e);
        }

        Ok(SandboxInstance::new(id))
    }

    /// Put a freshly created instance into service. Hands it back when the
    /// pool is closing or (after a give-back raced in) already full.
    fn offer(&self, instance: SandboxInstance) -> Result<(), SandboxInstance> {
        let mut state = self.state();
        if state.closed {
            return Err(instance);
        }
        match state.place(instance, self.capacity, false) {
            Placement::Handed | Placement::Buffered => Ok(()),
            Placement::Rejected(instance) => Err(instance),
        }
    }

    fn record_failure(&self, retry: &RetryState) {
        let mut state = self.state();
        state.consecutive_failures = retry.consecutive_failures();
        state.degraded = retry.is_tripped();
    }

    /// Count a successful creation, whatever becomes of the instance.
    fn record_success(&self) {
        let mut state = self.state();
        state.created += 1;
        state.consecutive_failures = 0;
        state.degraded = false;
    }
}

// ---------------------------------------------------------------------------
// Waiting for an instance
// ---------------------------------------------------------------------------

/// A place in the waiter queue. Dropping it withdraws from the queue; an
/// instance that was already handed over but not yet taken goes back to
/// the next waiter or the buffer.
struct Ticket {
    shared: Arc<Shared>,
    ticket: u64,
    rx: oneshot::Receiver<SandboxInstance>,
    taken: bool,
}

impl Ticket {
    async fn recv(&mut self) -> Result<SandboxInstance, PoolError> {
        let received = (&mut self.rx).await;
        self.taken = true;
        // The sender is only dropped unused when the pool shuts down.
        received.map_err(|_| PoolError::Closed)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        self.rx.close();
        let mut state = self.shared.state();
        state.waiters.retain(|w| w.ticket != self.ticket);
        let Ok(instance) = self.rx.try_recv() else {
            return;
        };
        debug!(id = %instance.id(), "waiter gave up, returning unused instance");
        let rejected = if state.closed {
            Some(instance)
        } else {
            match state.place(instance, self.shared.capacity, true) {
                Placement::Handed | Placement::Buffered => None,
                Placement::Rejected(instance) => Some(instance),
            }
        };
        drop(state);
        if let Some(instance) = rejected {
            // Destroyed by the lease's drop path.
            drop(self.shared.lease(instance));
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct Pool {
    shared: Arc<Shared>,
    started: AtomicBool,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Create an empty pool. Nothing is provisioned until [`start`](Self::start).
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: PoolSettings) -> Self {
        let capacity = settings.capacity.max(1);
        let reaper = Arc::new(Reaper::new(Arc::clone(&runtime)));
        let shared = Arc::new(Shared {
            runtime,
            reaper,
            spec: settings.spec,
            capacity,
            state: Mutex::new(PoolState {
                ready: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
                next_ticket: 0,
                closed: false,
                created: 0,
                consecutive_failures: 0,
                degraded: false,
            }),
            vacancy: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        Self {
            shared,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Launch the replenishment task. Calls after the first are no-ops, as
    /// is starting a pool that was already stopped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stopped.load(Ordering::Acquire) {
            warn!("start called on a stopped pool, ignoring");
            return;
        }
        info!(
            capacity = self.shared.capacity,
            backend = self.shared.runtime.name(),
            "starting sandbox pool"
        );
        let handle = tokio::spawn(replenish(Arc::clone(&self.shared)));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Take one ready instance, waiting for the replenisher if none is
    /// buffered.
    ///
    /// Returns [`PoolError::Cancelled`] as soon as `cancel` fires (an
    /// already-cancelled token never consumes an instance) and
    /// [`PoolError::Closed`] once the pool is stopped.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let mut ticket = {
            let mut state = self.shared.state();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(instance) = state.ready.pop_front() {
                let remaining = state.ready.len();
                drop(state);
                self.shared.vacancy.notify_one();
                debug!(id = %instance.id(), remaining, "acquired pre-warmed instance");
                return Ok(self.shared.lease(instance));
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(Waiter { ticket, tx });
            debug!(ticket, waiting = state.waiters.len(), "pool empty, waiting");
            Ticket {
                shared: Arc::clone(&self.shared),
                ticket,
                rx,
                taken: false,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            received = ticket.recv() => {
                let instance = received?;
                debug!(id = %instance.id(), "acquired instance after waiting");
                Ok(self.shared.lease(instance))
            }
        }
    }

    /// Stop replenishing, wake every waiter with [`PoolError::Closed`], wait
    /// for the background task and destroy whatever is still buffered.
    ///
    /// Instances already leased are left to their leases.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping sandbox pool");

        {
            let mut state = self.shared.state();
            state.closed = true;
            // Dropping the senders wakes the waiters.
            state.waiters.clear();
        }
        self.shared.shutdown.cancel();

        // The teardown outlives a dropped `stop` future.
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let shared = Arc::clone(&self.shared);
        let teardown = tokio::spawn(async move {
            if let Some(task) = task
                && let Err(e) = task.await
            {
                error!(error = %e, "replenishment task failed");
            }

            let drained: Vec<SandboxInstance> = shared.state().ready.drain(..).collect();
            info!(count = drained.len(), "destroying buffered instances");
            shared.reaper.destroy_all(drained).await;
        });
        if let Err(e) = teardown.await {
            error!(error = %e, "pool teardown task failed");
        }
        info!("sandbox pool stopped");
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        let health = if state.closed {
            PoolHealth::Stopped
        } else if state.degraded {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        };
        PoolStats {
            ready: state.ready.len(),
            capacity: self.shared.capacity,
            waiting: state.waiters.len(),
            created: state.created,
            destroyed: self.shared.reaper.destroyed(),
            consecutive_failures: state.consecutive_failures,
            health,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.shared.shutdown.cancel();
        let ready = self.shared.state().ready.len();
        if ready > 0 {
            warn!(ready, "Pool dropped without calling stop(), buffered instances leaked");
        }
    }
}

// ---------------------------------------------------------------------------
// Replenishment
// ---------------------------------------------------------------------------

async fn replenish(shared: Arc<Shared>) {
    let mut retry = RetryState::new(BACKOFF_INITIAL, BACKOFF_MAX, BREAKER_THRESHOLD);

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        if shared.is_full() {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.vacancy.notified() => {}
                _ = tokio::time::sleep(FULL_POLL_INTERVAL) => {}
            }
            continue;
        }

        match shared.provision().await {
            Ok(instance) => {
                if retry.on_success() {
                    info!("instance creation recovered");
                }
                shared.record_success();
                let id = instance.id().clone();
                match shared.offer(instance) {
                    Ok(()) => debug!(id = %id, "pre-warmed instance ready"),
                    Err(instance) => {
                        let closing = shared.shutdown.is_cancelled();
                        debug!(id = %id, closing, "no room for new instance, destroying");
                        shared.reaper.destroy(instance).await;
                        if closing {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let delay = retry.on_failure();
                shared.record_failure(&retry);
                warn!(
                    error = %e,
                    consecutive_failures = retry.consecutive_failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "failed to create pre-warmed instance"
                );
                if retry.just_tripped() {
                    error!(
                        consecutive_failures = retry.consecutive_failures(),
                        "instance creation keeps failing, pool degraded"
                    );
                }
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("replenishment task exited");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
