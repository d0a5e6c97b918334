//! Object Registry - the live set of hosted objects
//!
//! Every structural operation (create, delete, delete-all, clone, list) runs
//! through one mutex around the `id -> entry` map. That critical section is the
//! single source of truth for "did object X exist at time T".
//!
//! ```text
//! ┌────────────────────────── ObjectRegistry ──────────────────────────┐
//! │  Mutex<HashMap<id, Arc<ObjectEntry>>>                              │
//! │        │                                                           │
//! │        ├── get(id) ──► ObjectHandle ──enter()──► CallPermit        │
//! │        │                  (Arc clone)    (per-object gate)         │
//! │        │                                                           │
//! │        └── delete(id) ──► entry.removed = true, map entry dropped  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A handle keeps the instance alive after deletion, so an in-flight call never
//! touches freed state. The call observes the `removed` flag instead and ends
//! with `ObjectGone`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{HostedObject, ObjectFactory};
use crate::codec::Payload;
use crate::config::{CallPolicy, ConfigStore};
use crate::error::{Error, Result};
use crate::metrics::OBJECTS_LIVE;

const STATUS_IDLE: &str = "idle";

/// A live registry record.
pub struct ObjectEntry {
    id: String,
    class_name: String,
    instance: Arc<dyn HostedObject>,
    /// Per-object call gate (unused under `CallPolicy::Concurrent`)
    gate: tokio::sync::Mutex<()>,
    removed: AtomicBool,
    status: Mutex<String>,
    created_at: Instant,
}

impl ObjectEntry {
    fn new(id: String, instance: Arc<dyn HostedObject>) -> Self {
        Self {
            class_name: instance.class_name().to_string(),
            id,
            instance,
            gate: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
            status: Mutex::new(STATUS_IDLE.to_string()),
            created_at: Instant::now(),
        }
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
        *self.status.lock() = "deleted".to_string();
    }
}

impl std::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("removed", &self.removed.load(Ordering::Acquire))
            .field("status", &*self.status.lock())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// Point-in-time description of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub id: String,
    pub class_name: String,
    pub status: String,
    pub age: Duration,
}

/// Non-owning reference to an object for the duration of one operation.
///
/// Callers drop it when the operation ends; the registry remains the owner.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    entry: Arc<ObjectEntry>,
    policy: CallPolicy,
}

impl ObjectHandle {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn class_name(&self) -> &str {
        &self.entry.class_name
    }

    /// True once the object has been deleted from the registry.
    pub fn is_removed(&self) -> bool {
        self.entry.removed.load(Ordering::Acquire)
    }

    /// Admit one function call according to the call policy.
    ///
    /// Under `Reject` an object that is already busy yields `Backpressure`.
    pub async fn enter(&self) -> Result<CallPermit<'_>> {
        self.admit(self.policy == CallPolicy::Reject).await
    }

    /// Like [`enter`](Self::enter), but always waits for the gate. Used for
    /// memory snapshots and clones, which should not bounce off a busy object.
    pub async fn enter_waiting(&self) -> Result<CallPermit<'_>> {
        self.admit(false).await
    }

    async fn admit(&self, reject_when_busy: bool) -> Result<CallPermit<'_>> {
        let gate = match self.policy {
            CallPolicy::Concurrent => None,
            _ if reject_when_busy => Some(self.entry.gate.try_lock().map_err(|_| {
                Error::Backpressure(format!("object `{}` is busy", self.entry.id))
            })?),
            _ => Some(self.entry.gate.lock().await),
        };

        let permit = CallPermit { handle: self, _gate: gate };
        permit.ensure_live()?;
        Ok(permit)
    }
}

/// Proof that a call has been admitted on an object.
pub struct CallPermit<'a> {
    handle: &'a ObjectHandle,
    _gate: Option<tokio::sync::MutexGuard<'a, ()>>,
}

impl CallPermit<'_> {
    pub fn object_id(&self) -> &str {
        &self.handle.entry.id
    }

    pub fn instance(&self) -> &Arc<dyn HostedObject> {
        &self.handle.entry.instance
    }

    /// `ObjectGone` if the object was deleted since the handle was taken.
    pub fn ensure_live(&self) -> Result<()> {
        if self.handle.is_removed() {
            return Err(Error::ObjectGone(self.handle.entry.id.clone()));
        }
        Ok(())
    }

    /// Update the diagnostic status string.
    pub fn set_status(&self, status: impl Into<String>) {
        if !self.handle.is_removed() {
            *self.handle.entry.status.lock() = status.into();
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.handle.is_removed() {
            *self.handle.entry.status.lock() = STATUS_IDLE.to_string();
        }
    }
}

/// Concurrent map of hosted objects.
pub struct ObjectRegistry {
    objects: Mutex<HashMap<String, Arc<ObjectEntry>>>,
    factory: Arc<dyn ObjectFactory>,
    config: Arc<ConfigStore>,
    policy: CallPolicy,
    /// 0 = unbounded
    max_objects: usize,
    default_class: String,
}

impl ObjectRegistry {
    pub fn new(factory: Arc<dyn ObjectFactory>, config: Arc<ConfigStore>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            factory,
            config,
            policy: CallPolicy::default(),
            max_objects: 0,
            default_class: crate::object::builtin::ECHO_CLASS.to_string(),
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_default_class(mut self, class_name: impl Into<String>) -> Self {
        self.default_class = class_name.into();
        self
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    /// Construct and insert a new object.
    ///
    /// An empty `id` asks the registry to generate one. On `AlreadyExists`
    /// the existing object is untouched and the freshly built instance is
    /// dropped.
    pub async fn create(&self, id: &str, class_name: &str, init_args: &Payload) -> Result<String> {
        let id = if id.is_empty() { generate_id() } else { id.to_string() };
        let class_name =
            if class_name.is_empty() { self.default_class.as_str() } else { class_name };

        // Cheap early rejection before running the constructor
        {
            let objects = self.objects.lock();
            if objects.contains_key(&id) {
                return Err(Error::AlreadyExists(id));
            }
            self.check_capacity(&objects)?;
        }

        let snapshot = self.config.snapshot();
        let instance = self.factory.construct(class_name, init_args, &snapshot).await?;

        self.insert(id, instance)
    }

    /// Remove an object. In-flight calls on it end with `ObjectGone`.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut objects = self.objects.lock();
        let entry = objects.remove(id).ok_or_else(|| Error::object_not_found(id))?;
        entry.mark_removed();
        OBJECTS_LIVE.set(objects.len() as f64);
        drop(objects);

        info!(object_id = id, "object deleted");
        Ok(())
    }

    /// Remove every object in one step. Returns how many were removed.
    pub fn delete_all(&self) -> usize {
        let mut objects = self.objects.lock();
        let count = objects.len();
        for (_, entry) in objects.drain() {
            entry.mark_removed();
        }
        OBJECTS_LIVE.set(0.0);
        drop(objects);

        info!(count, "all objects deleted");
        count
    }

    /// Deep-copy an object under a fresh id.
    ///
    /// The source's gate is held while forking so the copy reflects a state
    /// between calls, never one in the middle of a call.
    pub async fn clone_object(&self, id: &str) -> Result<String> {
        let source = self.get(id)?;
        let instance = {
            let permit = source.enter_waiting().await.map_err(|e| match e {
                Error::ObjectGone(id) => Error::object_not_found(id),
                other => other,
            })?;
            permit.set_status("cloning");
            permit.instance().fork().await.map_err(Error::ConstructionFailed)?
        };

        let new_id = generate_id();
        self.insert(new_id.clone(), instance)?;
        debug!(source = id, clone = %new_id, "object cloned");
        Ok(new_id)
    }

    /// Snapshot of all live ids.
    pub fn list(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Snapshot of all live objects, oldest first.
    pub fn list_summaries(&self) -> Vec<ObjectSummary> {
        let mut entries: Vec<Arc<ObjectEntry>> = self.objects.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
            .iter()
            .map(|e| ObjectSummary {
                id: e.id.clone(),
                class_name: e.class_name.clone(),
                status: e.status.lock().clone(),
                age: e.created_at.elapsed(),
            })
            .collect()
    }

    /// Handle for one operation on `id`.
    pub fn get(&self, id: &str) -> Result<ObjectHandle> {
        let objects = self.objects.lock();
        let entry = objects.get(id).ok_or_else(|| Error::object_not_found(id))?;
        Ok(ObjectHandle { entry: Arc::clone(entry), policy: self.policy })
    }

    /// The object's memory snapshot.
    pub async fn memory(&self, id: &str) -> Result<Payload> {
        let handle = self.get(id)?;
        let permit = handle.enter_waiting().await.map_err(|e| match e {
            Error::ObjectGone(id) => Error::object_not_found(id),
            other => other,
        })?;
        Ok(permit.instance().memory().await)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, id: String, instance: Arc<dyn HostedObject>) -> Result<String> {
        let mut objects = self.objects.lock();
        if objects.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        self.check_capacity(&objects)?;

        let class_name = instance.class_name().to_string();
        let previous = objects.insert(id.clone(), Arc::new(ObjectEntry::new(id.clone(), instance)));
        if previous.is_some() {
            tracing::error!(object_id = %id, "registry invariant violated: id replaced under lock");
            debug_assert!(previous.is_none(), "registry map corrupted for id {}", id);
        }
        OBJECTS_LIVE.set(objects.len() as f64);
        drop(objects);

        info!(object_id = %id, class = %class_name, "object created");
        Ok(id)
    }

    fn check_capacity(&self, objects: &HashMap<String, Arc<ObjectEntry>>) -> Result<()> {
        if self.max_objects > 0 && objects.len() >= self.max_objects {
            return Err(Error::CapacityExceeded(self.max_objects));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.len())
            .field("policy", &self.policy)
            .field("max_objects", &self.max_objects)
            .finish()
    }
}

fn generate_id() -> String {
    Uuid::now_v7().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::builtin;
    use bytes::Bytes;

    fn registry() -> ObjectRegistry {
        ObjectRegistry::new(Arc::new(builtin::factory()), Arc::new(ConfigStore::new()))
    }

    async fn counter(registry: &ObjectRegistry, id: &str) -> Payload {
        let handle = registry.get(id).unwrap();
        let permit = handle.enter().await.unwrap();
        permit.instance().invoke("get", Payload::empty()).await.result
    }

    async fn incr(registry: &ObjectRegistry, id: &str) {
        let handle = registry.get(id).unwrap();
        let permit = handle.enter().await.unwrap();
        permit.instance().invoke("incr", Payload::empty()).await;
    }

    #[tokio::test]
    async fn test_create_delete_create_reuses_id() {
        let registry = registry();
        registry.create("a1", "echo", &Payload::empty()).await.unwrap();
        registry.delete("a1").unwrap();
        assert_eq!(registry.create("a1", "echo", &Payload::empty()).await.unwrap(), "a1");
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_first_instance() {
        let registry = registry();
        registry.create("a1", "echo", &Payload::empty()).await.unwrap();
        incr(&registry, "a1").await;

        let err = registry
            .create("a1", "echo", &Payload::from(r#"{"counter":100}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(ref id) if id == "a1"));
        assert_eq!(counter(&registry, "a1").await, Payload::from("1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let registry = registry();
        let a = registry.create("", "", &Payload::empty()).await.unwrap();
        let b = registry.create("", "", &Payload::empty()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get(&a).unwrap().class_name(), "echo");
    }

    #[tokio::test]
    async fn test_unknown_class_does_not_insert() {
        let registry = registry();
        let err = registry.create("x", "nope", &Payload::empty()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = registry().with_max_objects(1);
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        let err = registry.create("b", "echo", &Payload::empty()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(1)));
        let err = registry.clone_object("a").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(1)));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let registry = registry();
        assert!(matches!(registry.delete("ghost"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_all_empties_and_invalidates_handles() {
        let registry = registry();
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        registry.create("b", "echo", &Payload::empty()).await.unwrap();
        let handle = registry.get("a").unwrap();

        assert_eq!(registry.delete_all(), 2);
        assert!(registry.list().is_empty());
        assert!(handle.is_removed());
        assert!(matches!(handle.enter().await, Err(Error::ObjectGone(_))));
        assert!(matches!(registry.get("a"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let registry = registry();
        registry.create("src", "echo", &Payload::empty()).await.unwrap();
        incr(&registry, "src").await;

        let copy = registry.clone_object("src").await.unwrap();
        assert_ne!(copy, "src");
        incr(&registry, &copy).await;
        incr(&registry, &copy).await;

        assert_eq!(counter(&registry, "src").await, Payload::from("1"));
        assert_eq!(counter(&registry, &copy).await, Payload::from("3"));
    }

    #[tokio::test]
    async fn test_clone_and_memory_of_missing_object() {
        let registry = registry();
        assert!(matches!(registry.clone_object("ghost").await, Err(Error::NotFound { .. })));
        assert!(matches!(registry.memory("ghost").await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_summaries_in_creation_order() {
        let registry = registry();
        registry.create("first", "echo", &Payload::empty()).await.unwrap();
        registry.create("second", "echo", &Payload::empty()).await.unwrap();

        let summaries = registry.list_summaries();
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert!(summaries.iter().all(|s| s.status == "idle"));
    }

    #[tokio::test]
    async fn test_reject_policy_bounces_overlapping_calls() {
        let registry = registry().with_policy(CallPolicy::Reject);
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        let handle = registry.get("a").unwrap();

        let first = handle.enter().await.unwrap();
        assert!(matches!(handle.enter().await, Err(Error::Backpressure(_))));
        drop(first);
        assert!(handle.enter().await.is_ok());
    }

    #[tokio::test]
    async fn test_serialized_policy_queues_overlapping_calls() {
        let registry = registry();
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        let handle = registry.get("a").unwrap();

        let first = handle.enter().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), handle.enter()).await;
        assert!(waiting.is_err(), "second call must wait for the first");
        drop(first);
        assert!(handle.enter().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_policy_admits_overlapping_calls() {
        let registry = registry().with_policy(CallPolicy::Concurrent);
        registry.create("a", "echo", &Payload::empty()).await.unwrap();
        let handle = registry.get("a").unwrap();

        let _first = handle.enter().await.unwrap();
        assert!(handle.enter().await.is_ok());
    }

    #[tokio::test]
    async fn test_config_applies_to_later_objects_only() {
        let store = Arc::new(ConfigStore::new());
        let registry = ObjectRegistry::new(Arc::new(builtin::factory()), Arc::clone(&store));
        registry.create("before", "echo", &Payload::empty()).await.unwrap();
        store.apply(Bytes::from_static(br#"{"m":1}"#), false).unwrap();
        registry.create("after", "echo", &Payload::empty()).await.unwrap();

        let before: serde_json::Value =
            serde_json::from_slice(registry.memory("before").await.unwrap().as_bytes()).unwrap();
        let after: serde_json::Value =
            serde_json::from_slice(registry.memory("after").await.unwrap().as_bytes()).unwrap();
        assert_eq!(before["config_version"], 0);
        assert_eq!(after["config_version"], 1);
    }
}
