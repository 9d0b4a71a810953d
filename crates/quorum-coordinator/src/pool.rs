use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use quorum_core::{SessionError, WorkerState, WorkerUnit};
use quorum_telemetry::MetricsRecorder;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Bounded wait for `allocate` before failing with `InsufficientCapacity`.
    pub allocate_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            allocate_timeout: Duration::from_secs(5),
        }
    }
}

struct Slot {
    unit: WorkerUnit,
    state: WorkerState,
    /// Drop from the pool on release instead of returning to Idle.
    retiring: bool,
}

/// Point-in-time view of one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub address: String,
    pub state: WorkerState,
    pub retiring: bool,
}

/// Tracks Idle vs InUse worker units.
///
/// All state lives behind one mutex, so every Idle→InUse transition of a
/// multi-unit allocation happens atomically: a caller gets all `count` units
/// or none. Waiters park on a `Notify` that fires whenever units come back.
pub struct WorkerPool {
    slots: Mutex<BTreeMap<String, Slot>>,
    available: Notify,
    config: PoolConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            available: Notify::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed a unit that is already running. Returns false if the name is already tracked.
    pub fn add_existing(&self, unit: WorkerUnit) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(&unit.name) {
            debug!(worker = %unit.name, "worker already tracked");
            return false;
        }
        info!(worker = %unit.name, address = %unit.address, "worker added to pool");
        slots.insert(
            unit.name.clone(),
            Slot {
                unit,
                state: WorkerState::Idle,
                retiring: false,
            },
        );
        self.publish(&slots);
        drop(slots);
        self.available.notify_waiters();
        true
    }

    /// Take `count` Idle units now, or none at all.
    pub fn try_allocate(&self, count: usize) -> Option<Vec<WorkerUnit>> {
        let mut slots = self.slots.lock();
        let picked: Vec<String> = slots
            .values()
            .filter(|s| s.state == WorkerState::Idle && !s.retiring)
            .take(count)
            .map(|s| s.unit.name.clone())
            .collect();
        if picked.len() < count {
            return None;
        }

        let mut units = Vec::with_capacity(count);
        for name in picked {
            if let Some(slot) = slots.get_mut(&name) {
                slot.state = WorkerState::InUse;
                units.push(slot.unit.clone());
            }
        }
        self.publish(&slots);
        Some(units)
    }

    /// Wait up to the configured timeout for `count` Idle units.
    pub async fn allocate(&self, count: usize) -> Result<Vec<WorkerUnit>, SessionError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.allocate_timeout;

        loop {
            // Register interest before checking, so a release between the
            // check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(units) = self.try_allocate(count) {
                debug!(count, waited_ms = started.elapsed().as_millis() as u64, "workers allocated");
                self.count_allocation("ok");
                return Ok(units);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let available = self.idle_count();
                warn!(requested = count, available, "worker allocation timed out");
                self.count_allocation("insufficient_capacity");
                return Err(SessionError::InsufficientCapacity {
                    requested: count,
                    available,
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Return a unit to Idle. Releasing an Idle or unknown unit is a no-op.
    pub fn release(&self, unit: &WorkerUnit) {
        self.release_all(std::slice::from_ref(unit));
    }

    pub fn release_all(&self, units: &[WorkerUnit]) {
        let mut slots = self.slots.lock();
        let mut freed = 0;
        for unit in units {
            let Some(slot) = slots.get_mut(&unit.name) else {
                debug!(worker = %unit.name, "release of untracked worker ignored");
                continue;
            };
            if slot.state != WorkerState::InUse {
                continue;
            }
            if slot.retiring {
                info!(worker = %unit.name, "retired worker removed on release");
                slots.remove(&unit.name);
            } else {
                slot.state = WorkerState::Idle;
                freed += 1;
            }
        }
        self.publish(&slots);
        drop(slots);
        if freed > 0 {
            self.available.notify_waiters();
        }
    }

    /// Remove a unit the provisioner reports as gone. An InUse unit stays
    /// with its session and is dropped when released. Returns false if unknown.
    pub fn retire(&self, name: &str) -> bool {
        let mut slots = self.slots.lock();
        let known = match slots.get(name).map(|s| s.state) {
            Some(WorkerState::InUse) => {
                if let Some(slot) = slots.get_mut(name) {
                    slot.retiring = true;
                }
                true
            }
            Some(WorkerState::Idle) => {
                slots.remove(name);
                true
            }
            None => false,
        };
        if known {
            info!(worker = name, "worker retired");
            self.publish(&slots);
        }
        known
    }

    /// Remove `name` only if it is Idle right now, handing the unit back for teardown.
    pub fn take_idle(&self, name: &str) -> Option<WorkerUnit> {
        let mut slots = self.slots.lock();
        if !matches!(slots.get(name), Some(s) if s.state == WorkerState::Idle && !s.retiring) {
            return None;
        }
        let slot = slots.remove(name)?;
        info!(worker = name, "idle worker taken out of the pool");
        self.publish(&slots);
        Some(slot.unit)
    }

    pub fn get(&self, name: &str) -> Option<WorkerUnit> {
        self.slots.lock().get(name).map(|s| s.unit.clone())
    }

    pub fn idle_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.state == WorkerState::Idle && !s.retiring)
            .count()
    }

    pub fn in_use_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.state == WorkerState::InUse)
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots
            .lock()
            .values()
            .map(|s| WorkerStatus {
                name: s.unit.name.clone(),
                address: s.unit.address.clone(),
                state: s.state,
                retiring: s.retiring,
            })
            .collect()
    }

    /// Allocate with guaranteed release when the lease is dropped.
    pub async fn lease(self: &Arc<Self>, count: usize) -> Result<WorkerLease, SessionError> {
        let units = self.allocate(count).await?;
        Ok(WorkerLease {
            pool: Arc::clone(self),
            units,
        })
    }

    pub fn try_lease(self: &Arc<Self>, count: usize) -> Option<WorkerLease> {
        let units = self.try_allocate(count)?;
        self.count_allocation("ok");
        Some(WorkerLease {
            pool: Arc::clone(self),
            units,
        })
    }

    fn count_allocation(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("pool.allocations.total", &[("outcome", outcome)], 1);
        }
    }

    fn publish(&self, slots: &BTreeMap<String, Slot>) {
        if let Some(m) = &self.metrics {
            let in_use = slots.values().filter(|s| s.state == WorkerState::InUse).count();
            m.gauge_set("pool.in_use", &[], in_use as f64);
            m.gauge_set("pool.idle", &[], (slots.len() - in_use) as f64);
        }
    }
}

/// Units held by one session. Dropping the lease releases them.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    units: Vec<WorkerUnit>,
}

impl WorkerLease {
    pub fn units(&self) -> &[WorkerUnit] {
        &self.units
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release_all(&self.units);
    }
}
