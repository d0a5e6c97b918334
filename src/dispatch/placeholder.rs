//! Result Placeholder Table - futures addressed by task id
//!
//! Every accepted async call gets a slot holding a `watch` channel whose value
//! moves once from `Pending` to a terminal state. Readers poll or wait on the
//! channel; the single writer is the worker running the call.
//!
//! ```text
//! allocate() ──► Pending ──resolve()──► Ready(outcome) | Failed(message)
//!                   ▲                          │
//!                read()/wait()            read()/wait() (repeatable)
//!                                              │
//!                               sweeper (ttl) / capacity pressure ──► evicted
//! ```
//!
//! Task ids come from a monotonic counter and are never reused, so a stale
//! id can only ever miss, never read someone else's result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::metrics::{PLACEHOLDERS_EVICTED, PLACEHOLDERS_PENDING};
use crate::object::CallOutcome;

/// State of one placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// The call ran; `ok` inside the outcome tells whether the object succeeded.
    Ready(CallOutcome),
    /// The call could not run to completion (object gone, dependency, shutdown).
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

struct Slot {
    tx: watch::Sender<TaskState>,
    resolved_at: Option<Instant>,
}

/// Counts reported by [`PlaceholderTable::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderStats {
    pub pending: usize,
    pub resolved: usize,
    pub capacity: usize,
}

/// Concurrent `task id -> future outcome` map.
pub struct PlaceholderTable {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
    capacity: usize,
    ttl: Duration,
}

impl PlaceholderTable {
    /// # Arguments
    /// * `capacity` - maximum slots held, pending and resolved together
    /// * `ttl` - how long a resolved slot survives before the sweeper drops it
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Allocate a new pending placeholder.
    ///
    /// When the table is full, expired results go first, then the oldest
    /// resolved one. A table full of pending calls is backpressure.
    pub fn allocate(&self) -> Result<u64> {
        let mut slots = self.slots.lock();

        if slots.len() >= self.capacity {
            self.evict_expired(&mut slots, Instant::now());
        }
        if slots.len() >= self.capacity {
            let oldest = slots
                .iter()
                .filter_map(|(id, slot)| slot.resolved_at.map(|at| (at, *id)))
                .min();
            match oldest {
                Some((_, id)) => {
                    slots.remove(&id);
                    PLACEHOLDERS_EVICTED.with_label_values(&["capacity"]).inc();
                    tracing::debug!(task_id = id, "evicted oldest result to make room");
                }
                None => {
                    return Err(Error::Backpressure(format!(
                        "all {} placeholders are pending",
                        self.capacity
                    )));
                }
            }
        }

        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(TaskState::Pending);
        slots.insert(task_id, Slot { tx, resolved_at: None });
        PLACEHOLDERS_PENDING.inc();
        Ok(task_id)
    }

    /// Move a placeholder from `Pending` to a terminal state.
    ///
    /// Resolving twice is a bug in the caller: it panics in debug builds and
    /// is logged and ignored in release builds.
    pub fn resolve(&self, task_id: u64, state: TaskState) {
        debug_assert!(state.is_terminal(), "resolve() needs a terminal state");

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&task_id) else {
            tracing::warn!(task_id, "resolve for unknown placeholder ignored");
            return;
        };

        if slot.tx.borrow().is_terminal() {
            drop(slots);
            tracing::error!(task_id, "placeholder resolved twice");
            if cfg!(debug_assertions) {
                panic!("placeholder {} resolved twice", task_id);
            }
            return;
        }

        slot.tx.send_replace(state);
        slot.resolved_at = Some(Instant::now());
        PLACEHOLDERS_PENDING.dec();
    }

    /// Current state, without waiting.
    pub fn read(&self, task_id: u64) -> Result<TaskState> {
        let slots = self.slots.lock();
        let slot = slots.get(&task_id).ok_or_else(|| Error::task_not_found(task_id))?;
        let state = slot.tx.borrow().clone();
        Ok(state)
    }

    /// Wait up to `timeout` for a terminal state.
    ///
    /// Returns the state seen when the wait ends, which is still `Pending` on
    /// timeout. Only the caller waits; the producer is never blocked.
    pub async fn wait(&self, task_id: u64, timeout: Duration) -> Result<TaskState> {
        let mut rx = {
            let slots = self.slots.lock();
            slots.get(&task_id).ok_or_else(|| Error::task_not_found(task_id))?.tx.subscribe()
        };
        if timeout.is_zero() {
            let state = rx.borrow().clone();
            return Ok(state);
        }

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(TaskState::is_terminal).await.map(|state| (*state).clone())
        })
        .await;

        match waited {
            Ok(Ok(state)) => Ok(state),
            // Sender dropped: the slot was evicted while we waited
            Ok(Err(_)) => Err(Error::task_not_found(task_id)),
            Err(_) => {
                let state = rx.borrow().clone();
                Ok(state)
            }
        }
    }

    /// Drop resolved placeholders older than the ttl. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut slots = self.slots.lock();
        self.evict_expired(&mut slots, Instant::now())
    }

    pub fn stats(&self) -> PlaceholderStats {
        let slots = self.slots.lock();
        let resolved = slots.values().filter(|s| s.resolved_at.is_some()).count();
        PlaceholderStats { pending: slots.len() - resolved, resolved, capacity: self.capacity }
    }

    fn evict_expired(&self, slots: &mut HashMap<u64, Slot>, now: Instant) -> usize {
        let before = slots.len();
        slots.retain(|_, slot| match slot.resolved_at {
            Some(at) => now.duration_since(at) < self.ttl,
            None => true,
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            PLACEHOLDERS_EVICTED.with_label_values(&["ttl"]).inc_by(evicted as f64);
        }
        evicted
    }

    /// Start the background sweeper
    ///
    /// Runs every `interval` and drops results older than the ttl.
    pub fn start_sweeper(table: Arc<PlaceholderTable>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = table.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "placeholder sweep");
                }
            }
        })
    }
}

impl std::fmt::Debug for PlaceholderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderTable")
            .field("stats", &self.stats())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(value: &'static str) -> TaskState {
        TaskState::Ready(CallOutcome::success(value))
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = PlaceholderTable::new(16, Duration::from_secs(60));
        assert_eq!(table.allocate().unwrap(), 1);
        assert_eq!(table.allocate().unwrap(), 2);
        assert_eq!(table.allocate().unwrap(), 3);
    }

    #[test]
    fn test_terminal_state_is_readable_repeatedly() {
        let table = PlaceholderTable::new(16, Duration::from_secs(60));
        let id = table.allocate().unwrap();
        assert_eq!(table.read(id).unwrap(), TaskState::Pending);

        table.resolve(id, ready("value"));
        assert_eq!(table.read(id).unwrap(), ready("value"));
        assert_eq!(table.read(id).unwrap(), ready("value"));
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let table = PlaceholderTable::new(16, Duration::from_secs(60));
        assert!(matches!(table.read(99), Err(Error::NotFound { .. })));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "resolved twice")]
    fn test_double_resolve_panics_in_debug() {
        let table = PlaceholderTable::new(16, Duration::from_secs(60));
        let id = table.allocate().unwrap();
        table.resolve(id, ready("first"));
        table.resolve(id, TaskState::Failed("second".into()));
    }

    #[tokio::test]
    async fn test_wait_sees_resolution_from_another_task() {
        let table = Arc::new(PlaceholderTable::new(16, Duration::from_secs(60)));
        let id = table.allocate().unwrap();

        let writer = Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.resolve(id, ready("late"));
        });

        let state = table.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, ready("late"));
    }

    #[tokio::test]
    async fn test_wait_times_out_with_pending() {
        let table = PlaceholderTable::new(16, Duration::from_secs(60));
        let id = table.allocate().unwrap();
        let state = table.wait(id, Duration::from_millis(20)).await.unwrap();
        assert_eq!(state, TaskState::Pending);
        assert_eq!(table.wait(id, Duration::ZERO).await.unwrap(), TaskState::Pending);
    }

    #[test]
    fn test_capacity_evicts_oldest_resolved() {
        let table = PlaceholderTable::new(2, Duration::from_secs(60));
        let first = table.allocate().unwrap();
        let second = table.allocate().unwrap();
        table.resolve(first, ready("a"));

        let third = table.allocate().unwrap();
        assert_eq!(third, 3);
        assert!(table.read(first).is_err());
        assert_eq!(table.read(second).unwrap(), TaskState::Pending);
    }

    #[test]
    fn test_capacity_full_of_pending_is_backpressure() {
        let table = PlaceholderTable::new(2, Duration::from_secs(60));
        table.allocate().unwrap();
        table.allocate().unwrap();
        assert!(matches!(table.allocate(), Err(Error::Backpressure(_))));
    }

    #[test]
    fn test_sweep_drops_only_expired_results() {
        let table = PlaceholderTable::new(16, Duration::ZERO);
        let done = table.allocate().unwrap();
        let pending = table.allocate().unwrap();
        table.resolve(done, ready("x"));

        assert_eq!(table.sweep(), 1);
        assert!(table.read(done).is_err());
        assert_eq!(table.read(pending).unwrap(), TaskState::Pending);
        assert_eq!(table.stats(), PlaceholderStats { pending: 1, resolved: 0, capacity: 16 });
    }
}
