//! Invocation Dispatcher - routes function calls to hosted objects
//!
//! Sync calls run on the request's own task. Async calls get a placeholder and
//! are spawned onto a bounded worker pool:
//!
//! ```text
//! call_async ─► registry.get ─► reserve slot ─► allocate task id ─► spawn
//!                 (NotFound)    (Backpressure)    (Backpressure)      │
//!                                                                     ▼
//!   resolve placeholder ◄── invoke ◄── worker permit ◄── object gate ◄── resolve deps
//! ```
//!
//! Workers are taken only after the object admits the call, so calls queued
//! behind one busy object never hold workers that other objects could use.
//!
//! A call on an object that is deleted while it runs still completes inside
//! the object (the handle keeps the instance alive) but reports `ObjectGone`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use super::placeholder::{PlaceholderTable, TaskState};
use crate::codec::Payload;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::{ASYNC_OUTSTANDING, CALLS_TOTAL, CALL_DURATION};
use crate::object::{CallOutcome, CallPermit, ObjectHandle, ObjectRegistry};

/// Argument of a function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Inline(Payload),
    /// The terminal value of an earlier async call, by task id.
    Placeholder(u64),
}

impl Default for Argument {
    fn default() -> Self {
        Argument::Inline(Payload::empty())
    }
}

impl From<Payload> for Argument {
    fn from(payload: Payload) -> Self {
        Argument::Inline(payload)
    }
}

enum Resolved {
    Value(Payload),
    DependencyFailed(CallOutcome),
}

/// Counts reported by [`Dispatcher::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Sync and async calls not finished yet
    pub in_flight: usize,
    /// Async calls holding a worker permit
    pub running: usize,
    /// Async calls accepted but not yet running
    pub queued: usize,
}

#[derive(Default)]
struct InFlightCounter {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlightCounter>);

impl InFlightGuard {
    fn enter(counter: &Arc<InFlightCounter>) -> Self {
        counter.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Routes sync and async calls.
pub struct Dispatcher {
    registry: Arc<ObjectRegistry>,
    results: Arc<PlaceholderTable>,
    workers: Semaphore,
    max_workers: usize,
    /// Accepted async calls not yet resolved, running or waiting
    outstanding: AtomicUsize,
    max_outstanding: usize,
    dependency_wait: Duration,
    max_fetch_wait: Duration,
    in_flight: Arc<InFlightCounter>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ObjectRegistry>,
        results: Arc<PlaceholderTable>,
        config: &ServerConfig,
    ) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            registry,
            results,
            workers: Semaphore::new(max_workers),
            max_workers,
            outstanding: AtomicUsize::new(0),
            max_outstanding: max_workers + config.max_queued,
            dependency_wait: config.dependency_wait,
            max_fetch_wait: config.max_fetch_wait,
            in_flight: Arc::new(InFlightCounter::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn results(&self) -> &Arc<PlaceholderTable> {
        &self.results
    }

    /// Run a call and wait for its outcome.
    pub async fn call_sync(
        &self,
        object_id: &str,
        function: &str,
        argument: Argument,
    ) -> Result<CallOutcome> {
        self.ensure_open()?;
        let handle = self.registry.get(object_id)?;
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        let result = match self.resolve_argument(argument).await {
            Ok(Resolved::Value(args)) => match handle.enter().await {
                Ok(permit) => self.invoke(permit, function, args).await,
                Err(e) => Err(e),
            },
            Ok(Resolved::DependencyFailed(outcome)) => Ok(outcome),
            Err(e) => Err(e),
        };
        record_call("sync", &result);
        result
    }

    /// Accept a call for background execution and return its task id.
    ///
    /// The target is resolved now: an unknown object fails here, not later
    /// through the placeholder.
    pub async fn call_async(
        self: &Arc<Self>,
        object_id: &str,
        function: &str,
        argument: Argument,
    ) -> Result<u64> {
        self.ensure_open()?;
        let handle = self.registry.get(object_id)?;

        let reserved = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if reserved >= self.max_outstanding {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Backpressure(format!(
                "{} async calls outstanding",
                self.max_outstanding
            )));
        }
        let task_id = match self.results.allocate() {
            Ok(id) => id,
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        ASYNC_OUTSTANDING.inc();

        let in_flight = InFlightGuard::enter(&self.in_flight);
        let this = Arc::clone(self);
        let function = function.to_string();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let result = this.run_async(&handle, &function, argument).await;
            record_call("async", &result);

            let state = match result {
                Ok(outcome) => TaskState::Ready(outcome),
                Err(e) => TaskState::Failed(e.to_string()),
            };
            this.results.resolve(task_id, state);
            this.outstanding.fetch_sub(1, Ordering::AcqRel);
            ASYNC_OUTSTANDING.dec();
        });

        debug!(task_id, object_id, "async call accepted");
        Ok(task_id)
    }

    /// State of an async call, waiting up to `wait` (capped) for it to finish.
    pub async fn fetch_result(&self, task_id: u64, wait: Duration) -> Result<TaskState> {
        self.results.wait(task_id, wait.min(self.max_fetch_wait)).await
    }

    /// Stop accepting new calls. Calls already accepted keep running.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("dispatcher closed to new calls");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `grace` for in-flight calls to finish.
    ///
    /// Returns false on timeout; async calls still waiting for a worker are
    /// then failed with `ShuttingDown`.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let left = self.in_flight.count.load(Ordering::Acquire);
                warn!(in_flight = left, "grace period over, abandoning queued calls");
                self.workers.close();
                return false;
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let running = self.max_workers.saturating_sub(self.workers.available_permits());
        let outstanding = self.outstanding.load(Ordering::Acquire);
        DispatcherStats {
            in_flight: self.in_flight.count.load(Ordering::Acquire),
            running,
            queued: outstanding.saturating_sub(running),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    async fn run_async(
        &self,
        handle: &ObjectHandle,
        function: &str,
        argument: Argument,
    ) -> Result<CallOutcome> {
        // Dependencies are awaited before taking a worker so that waiting
        // calls never starve the ones they wait on.
        let args = match self.resolve_argument(argument).await? {
            Resolved::Value(args) => args,
            Resolved::DependencyFailed(outcome) => return Ok(outcome),
        };
        let permit = handle.enter().await?;
        let _worker = self.workers.acquire().await.map_err(|_| Error::ShuttingDown)?;
        self.invoke(permit, function, args).await
    }

    async fn resolve_argument(&self, argument: Argument) -> Result<Resolved> {
        let task_id = match argument {
            Argument::Inline(payload) => return Ok(Resolved::Value(payload)),
            Argument::Placeholder(task_id) => task_id,
        };

        match self.results.wait(task_id, self.dependency_wait).await? {
            TaskState::Pending => Err(Error::UnresolvedDependency(task_id)),
            TaskState::Ready(outcome) if outcome.ok => Ok(Resolved::Value(outcome.result)),
            TaskState::Ready(outcome) => Ok(Resolved::DependencyFailed(CallOutcome::failure(
                format!("dependency task {} failed: {}", task_id, outcome.message),
            ))),
            TaskState::Failed(message) => Ok(Resolved::DependencyFailed(CallOutcome::failure(
                format!("dependency task {} failed: {}", task_id, message),
            ))),
        }
    }

    async fn invoke(
        &self,
        permit: CallPermit<'_>,
        function: &str,
        args: Payload,
    ) -> Result<CallOutcome> {
        permit.set_status(format!("running {}", function));

        let start = Instant::now();
        let outcome = AssertUnwindSafe(permit.instance().invoke(function, args))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_message(&*panic);
                error!(object_id = permit.object_id(), function, %reason, "hosted object panicked");
                CallOutcome::failure(format!("function `{}` panicked: {}", function, reason))
            });
        CALL_DURATION.observe(start.elapsed().as_secs_f64());

        // Deleted while running: the work happened but nobody owns the object
        permit.ensure_live()?;
        Ok(outcome)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .field("max_workers", &self.max_workers)
            .field("max_outstanding", &self.max_outstanding)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn record_call(mode: &str, result: &Result<CallOutcome>) {
    let outcome = match result {
        Ok(o) if o.ok => "ok",
        Ok(_) => "failed",
        Err(e) => e.kind(),
    };
    CALLS_TOTAL.with_label_values(&[mode, outcome]).inc();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::object::builtin;

    async fn dispatcher(config: ServerConfig) -> Arc<Dispatcher> {
        let registry = Arc::new(ObjectRegistry::new(
            Arc::new(builtin::factory()),
            Arc::new(ConfigStore::new()),
        ));
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        let results = Arc::new(PlaceholderTable::new(config.result_capacity, config.result_ttl));
        Arc::new(Dispatcher::new(registry, results, &config))
    }

    fn inline(s: &'static str) -> Argument {
        Argument::Inline(Payload::from(s))
    }

    #[tokio::test]
    async fn test_sync_ping_and_missing_function() {
        let d = dispatcher(ServerConfig::default()).await;

        let pong = d.call_sync("a", "ping", Argument::default()).await.unwrap();
        assert_eq!(pong, CallOutcome::success("pong"));

        let missing = d.call_sync("a", "missing_fn", Argument::default()).await.unwrap();
        assert!(!missing.ok);
        assert_eq!(missing.message, "no such function");
    }

    #[tokio::test]
    async fn test_unknown_object_is_not_found() {
        let d = dispatcher(ServerConfig::default()).await;
        assert!(matches!(
            d.call_sync("ghost", "ping", Argument::default()).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            d.call_async("ghost", "ping", Argument::default()).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(d.results().stats().pending, 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_functional_failure() {
        let d = dispatcher(ServerConfig::default()).await;
        let outcome = d.call_sync("a", "panic", Argument::default()).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.message.contains("panicked"));

        // Object still usable afterwards
        let pong = d.call_sync("a", "ping", Argument::default()).await.unwrap();
        assert!(pong.ok);
    }

    #[tokio::test]
    async fn test_async_slow_call_first_task_id_and_idempotent_fetch() {
        let d = dispatcher(ServerConfig::default()).await;
        let task_id =
            d.call_async("a", "slow_fn", inline(r#"{"ms":100,"value":"done"}"#)).await.unwrap();
        assert_eq!(task_id, 1);

        assert_eq!(d.fetch_result(task_id, Duration::ZERO).await.unwrap(), TaskState::Pending);

        let expected = TaskState::Ready(CallOutcome::success(r#""done""#));
        assert_eq!(d.fetch_result(task_id, Duration::from_secs(5)).await.unwrap(), expected);
        assert_eq!(d.fetch_result(task_id, Duration::ZERO).await.unwrap(), expected);
        assert_eq!(d.fetch_result(task_id, Duration::from_secs(1)).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_async_backpressure_when_pool_and_queue_full() {
        let config = ServerConfig { max_workers: 1, max_queued: 0, ..ServerConfig::default() };
        let d = dispatcher(config).await;

        let first = d.call_async("a", "slow_fn", inline(r#"{"ms":300}"#)).await.unwrap();
        let err = d.call_async("a", "ping", Argument::default()).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure(_)));

        d.fetch_result(first, Duration::from_secs(5)).await.unwrap();
        // Slot released once the first call resolved
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(d.call_async("a", "ping", Argument::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_placeholder_argument_uses_dependency_result() {
        let d = dispatcher(ServerConfig::default()).await;
        let dep = d.call_async("a", "echo", inline("hello")).await.unwrap();

        let outcome = d.call_sync("a", "echo", Argument::Placeholder(dep)).await.unwrap();
        assert_eq!(outcome, CallOutcome::success("hello"));
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_functionally() {
        let d = dispatcher(ServerConfig::default()).await;
        let dep = d.call_async("a", "fail", inline("boom")).await.unwrap();

        let outcome = d.call_sync("a", "echo", Argument::Placeholder(dep)).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_unknown_and_unresolved_dependencies() {
        let config =
            ServerConfig { dependency_wait: Duration::from_millis(20), ..ServerConfig::default() };
        let d = dispatcher(config).await;

        let err = d.call_sync("a", "echo", Argument::Placeholder(42)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let slow = d.call_async("a", "slow_fn", inline(r#"{"ms":500}"#)).await.unwrap();
        let err = d.call_sync("a", "echo", Argument::Placeholder(slow)).await.unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency(id) if id == slow));
    }

    #[tokio::test]
    async fn test_delete_during_call_is_object_gone() {
        let d = dispatcher(ServerConfig::default()).await;

        let deleter = Arc::clone(&d);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            deleter.registry().delete("a").unwrap();
        });

        let err = d.call_sync("a", "slow_fn", inline(r#"{"ms":150}"#)).await.unwrap_err();
        assert!(matches!(err, Error::ObjectGone(ref id) if id == "a"));
    }

    #[tokio::test]
    async fn test_delete_during_async_call_fails_placeholder() {
        let d = dispatcher(ServerConfig::default()).await;
        let task = d.call_async("a", "slow_fn", inline(r#"{"ms":150}"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(d.registry().delete_all(), 1);

        let state = d.fetch_result(task, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(state, TaskState::Failed(ref m) if m.contains("was deleted")));
    }

    #[tokio::test]
    async fn test_close_rejects_and_drain_waits() {
        let d = dispatcher(ServerConfig::default()).await;
        let task = d.call_async("a", "slow_fn", inline(r#"{"ms":50}"#)).await.unwrap();

        d.close();
        assert!(matches!(
            d.call_sync("a", "ping", Argument::default()).await,
            Err(Error::ShuttingDown)
        ));
        assert!(d.drain(Duration::from_secs(5)).await);
        assert_eq!(d.stats().in_flight, 0);
        assert!(matches!(d.results().read(task).unwrap(), TaskState::Ready(_)));
    }

    #[tokio::test]
    async fn test_call_outcomes_are_counted_by_label() {
        let d = dispatcher(ServerConfig::default()).await;
        let failed = CALLS_TOTAL.with_label_values(&["sync", "failed"]);
        let not_found = CALLS_TOTAL.with_label_values(&["sync", "not_found"]);
        let (failed_before, not_found_before) = (failed.get(), not_found.get());

        // Caught panics count as plain failures
        d.call_sync("a", "panic", Argument::default()).await.unwrap();
        d.call_sync("a", "echo", Argument::Placeholder(777)).await.unwrap_err();

        assert!(failed.get() >= failed_before + 1.0);
        assert!(not_found.get() >= not_found_before + 1.0);
    }

    #[tokio::test]
    async fn test_busy_object_does_not_starve_other_objects() {
        let config = ServerConfig { max_workers: 2, ..ServerConfig::default() };
        let d = dispatcher(config).await;
        d.registry().create("b", "echo", &Payload::empty()).await.unwrap();

        for _ in 0..3 {
            d.call_async("a", "slow_fn", inline(r#"{"ms":600}"#)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Only the call holding a's gate occupies a worker
        assert_eq!(d.stats().running, 1);

        let ping = d.call_async("b", "ping", Argument::default()).await.unwrap();
        let state = d.fetch_result(ping, Duration::from_millis(300)).await.unwrap();
        assert_eq!(state, TaskState::Ready(CallOutcome::success("pong")));
    }

    #[tokio::test]
    async fn test_drain_timeout_fails_calls_waiting_for_a_worker() {
        let config = ServerConfig { max_workers: 1, ..ServerConfig::default() };
        let d = dispatcher(config).await;
        d.registry().create("b", "echo", &Payload::empty()).await.unwrap();

        let long = d.call_async("a", "slow_fn", inline(r#"{"ms":400}"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = d.call_async("b", "ping", Argument::default()).await.unwrap();
        assert_eq!(d.stats().queued, 1);

        d.close();
        assert!(!d.drain(Duration::from_millis(50)).await);

        let state = d.fetch_result(queued, Duration::from_secs(1)).await.unwrap();
        assert_eq!(state, TaskState::Failed("server is shutting down".to_string()));
        // The call that already had a worker still completes
        let state = d.fetch_result(long, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(state, TaskState::Ready(ref o) if o.ok));
    }
}
