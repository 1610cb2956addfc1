//! Monitor Registry
//!
//! Table of live background tasks keyed by `(instrument, purpose)`. Each entry
//! is a cancellable handle: a `CancellationToken` plus the task's `JoinHandle`.
//!
//! Invariants:
//! - At most one live entry per key. Registering over an existing key cancels
//!   the previous task and awaits its termination before the new task starts.
//! - A task removes its own entry when it exits, however it exits. Removal is
//!   matched by generation so a finishing task never removes its successor.
//! - The task map lock is never held across an `.await`; registrations and
//!   cancellations are serialised by a separate async lock.
//!
//! The registry also carries the `ProtectiveOrderState` each monitor publishes,
//! so the trader and the sweeper can observe protection they do not own.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::trade::ProtectiveOrderState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPurpose {
    OrderFillWatch,
    TrailingMonitor,
    ScanLoop,
}

impl TaskPurpose {
    /// Fill-watch and trailing monitor exist only while a position does
    pub fn is_position_bound(&self) -> bool {
        !matches!(self, TaskPurpose::ScanLoop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPurpose::OrderFillWatch => "order-fill-watch",
            TaskPurpose::TrailingMonitor => "trailing-monitor",
            TaskPurpose::ScanLoop => "scan-loop",
        }
    }
}

impl fmt::Display for TaskPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub instrument: Instrument,
    pub purpose: TaskPurpose,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument, self.purpose)
    }
}

/// Handed to every registered task
pub struct TaskContext {
    pub key: TaskKey,
    pub generation: u64,
    pub token: CancellationToken,
    pub registry: MonitorRegistry,
}

struct TaskHandle {
    generation: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Read-only view of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntryInfo {
    pub instrument: Instrument,
    pub purpose: TaskPurpose,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

struct RegistryInner {
    tasks: Mutex<HashMap<TaskKey, TaskHandle>>,
    protection: Mutex<HashMap<Instrument, ProtectiveOrderState>>,
    registration: AsyncMutex<()>,
    next_generation: AtomicU64,
    cancel_grace: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the owning task's entry on drop, including abort and panic
struct EntryGuard {
    registry: Weak<RegistryInner>,
    key: TaskKey,
    generation: u64,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut tasks = lock(&inner.tasks);
        let owned = tasks
            .get(&self.key)
            .map_or(false, |handle| handle.generation == self.generation);
        if owned {
            tasks.remove(&self.key);
            debug!("Released registry entry {} (generation {})", self.key, self.generation);
        }
    }
}

#[derive(Clone)]
pub struct MonitorRegistry {
    inner: Arc<RegistryInner>,
}

impl MonitorRegistry {
    /// `cancel_grace` bounds how long a cancelled task may take to stop
    /// before it is aborted
    pub fn new(cancel_grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tasks: Mutex::new(HashMap::new()),
                protection: Mutex::new(HashMap::new()),
                registration: AsyncMutex::new(()),
                next_generation: AtomicU64::new(0),
                cancel_grace,
            }),
        }
    }

    /// Spawn `task` under `(instrument, purpose)`, replacing any live entry.
    ///
    /// Returns the generation of the new entry. The task does not start
    /// until its entry is stored.
    pub async fn register<F, Fut>(&self, instrument: Instrument, purpose: TaskPurpose, task: F) -> u64
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = TaskKey { instrument, purpose };
        let _serial = self.inner.registration.lock().await;

        let previous = lock(&self.inner.tasks).remove(&key);
        if let Some(previous) = previous {
            info!("Replacing live task {} (generation {})", key, previous.generation);
            previous.token.cancel();
            self.await_termination(&key, previous).await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ctx = TaskContext {
            key: key.clone(),
            generation,
            token: token.clone(),
            registry: self.clone(),
        };
        let guard = EntryGuard {
            registry: Arc::downgrade(&self.inner),
            key: key.clone(),
            generation,
        };

        let join = tokio::spawn(async move {
            let _guard = guard;
            if gate_rx.await.is_err() || ctx.token.is_cancelled() {
                return;
            }
            task(ctx).await;
        });

        lock(&self.inner.tasks).insert(
            key.clone(),
            TaskHandle {
                generation,
                token,
                join,
                started_at: Utc::now(),
            },
        );
        let _ = gate_tx.send(());
        debug!("Registered {} (generation {})", key, generation);
        generation
    }

    /// Cancel and await position-bound tasks for one instrument, or for all
    /// instruments when `None`. Scan loops are left running.
    pub async fn cancel_all(&self, instrument: Option<&Instrument>) -> usize {
        let _serial = self.inner.registration.lock().await;
        let cancelled = self
            .cancel_matching(|key, _| {
                key.purpose.is_position_bound() && instrument.map_or(true, |i| &key.instrument == i)
            })
            .await;

        let mut protection = lock(&self.inner.protection);
        match instrument {
            Some(instrument) => {
                protection.remove(instrument);
            }
            None => protection.clear(),
        }
        cancelled
    }

    /// Cancel and await a single entry
    pub async fn cancel(&self, instrument: &Instrument, purpose: TaskPurpose) -> bool {
        let _serial = self.inner.registration.lock().await;
        self.cancel_matching(|key, _| &key.instrument == instrument && key.purpose == purpose)
            .await
            > 0
    }

    /// Cancel the other position-bound tasks of the caller's instrument.
    ///
    /// Meant to be called from inside a registered task; returns without
    /// cancelling anything if the caller is itself being cancelled.
    pub async fn cancel_siblings(&self, ctx: &TaskContext) -> usize {
        let serial = tokio::select! {
            _ = ctx.token.cancelled() => return 0,
            serial = self.inner.registration.lock() => serial,
        };
        let cancelled = self
            .cancel_matching(|key, handle| {
                key.instrument == ctx.key.instrument
                    && key.purpose.is_position_bound()
                    && handle.generation != ctx.generation
            })
            .await;
        drop(serial);
        cancelled
    }

    /// Cancel every task, scan loops included
    pub async fn shutdown(&self) -> usize {
        let _serial = self.inner.registration.lock().await;
        let cancelled = self.cancel_matching(|_, _| true).await;
        lock(&self.inner.protection).clear();
        cancelled
    }

    async fn cancel_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&TaskKey, &TaskHandle) -> bool,
    {
        let removed: Vec<(TaskKey, TaskHandle)> = {
            let mut tasks = lock(&self.inner.tasks);
            let keys: Vec<TaskKey> = tasks
                .iter()
                .filter(|(key, handle)| predicate(key, handle))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|handle| (key, handle)))
                .collect()
        };

        for (_, handle) in &removed {
            handle.token.cancel();
        }
        let count = removed.len();
        for (key, handle) in removed {
            self.await_termination(&key, handle).await;
        }
        count
    }

    async fn await_termination(&self, key: &TaskKey, handle: TaskHandle) {
        let mut join = handle.join;
        match tokio::time::timeout(self.inner.cancel_grace, &mut join).await {
            Ok(_) => debug!("Task {} stopped", key),
            Err(_) => {
                warn!(
                    "Task {} did not stop within {:?}, aborting",
                    key, self.inner.cancel_grace
                );
                join.abort();
                let _ = join.await;
            }
        }
    }

    /// True iff a fill-watch or trailing monitor is live for `instrument`
    pub fn is_monitored(&self, instrument: &Instrument) -> bool {
        lock(&self.inner.tasks).iter().any(|(key, handle)| {
            &key.instrument == instrument
                && key.purpose.is_position_bound()
                && !handle.join.is_finished()
        })
    }

    pub fn is_live(&self, instrument: &Instrument, purpose: TaskPurpose) -> bool {
        let key = TaskKey {
            instrument: instrument.clone(),
            purpose,
        };
        lock(&self.inner.tasks)
            .get(&key)
            .map_or(false, |handle| !handle.join.is_finished())
    }

    /// Instruments with at least one position-bound entry
    pub fn monitored_instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = lock(&self.inner.tasks)
            .keys()
            .filter(|key| key.purpose.is_position_bound())
            .map(|key| key.instrument.clone())
            .collect();
        instruments.sort();
        instruments.dedup();
        instruments
    }

    pub fn entries(&self) -> Vec<RegistryEntryInfo> {
        let mut entries: Vec<RegistryEntryInfo> = lock(&self.inner.tasks)
            .iter()
            .map(|(key, handle)| RegistryEntryInfo {
                instrument: key.instrument.clone(),
                purpose: key.purpose,
                generation: handle.generation,
                started_at: handle.started_at,
            })
            .collect();
        entries.sort_by(|a, b| (&a.instrument, a.purpose).cmp(&(&b.instrument, b.purpose)));
        entries
    }

    pub fn publish_protection(&self, state: ProtectiveOrderState) {
        lock(&self.inner.protection).insert(state.instrument.clone(), state);
    }

    pub fn protection(&self, instrument: &Instrument) -> Option<ProtectiveOrderState> {
        lock(&self.inner.protection).get(instrument).cloned()
    }

    pub fn clear_protection(&self, instrument: &Instrument) -> Option<ProtectiveOrderState> {
        lock(&self.inner.protection).remove(instrument)
    }

    pub fn protections(&self) -> Vec<ProtectiveOrderState> {
        let mut states: Vec<ProtectiveOrderState> =
            lock(&self.inner.protection).values().cloned().collect();
        states.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        states
    }
}
