//! In-memory [`ObjectStore`] that behaves like a small API server: it assigns
//! uids and resource versions, keeps status untouched on update, honours
//! dry-run, and can inject failures, create races and server-side defaults.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use capsule_core::{gvk_of, Capsule, ObjectKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::{ObjectStore, StoreError};

type Defaulter = Arc<dyn Fn(&ObjectKey, &mut DynamicObject) + Send + Sync>;

/// Number of calls that reached the store, by verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub dry_runs: usize,
    pub status_updates: usize,
}

impl WriteCounts {
    /// Creates, updates and deletes that were persisted.
    pub fn mutations(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, DynamicObject>,
    capsules: FxHashMap<(String, String), Capsule>,
    next_rv: u64,
    counts: WriteCounts,
    failing: FxHashSet<GroupVersionKind>,
    races: FxHashSet<ObjectKey>,
    race_every_create: bool,
    fail_status: bool,
    defaulter: Option<Defaulter>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object as if something else created it. Returns it as stored.
    pub fn insert(&self, mut obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(&obj)?;
        let mut inner = self.lock();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Seed a Capsule, assigning uid, generation and resourceVersion if unset.
    pub fn insert_capsule(&self, mut capsule: Capsule) -> Capsule {
        let mut inner = self.lock();
        capsule.metadata.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        capsule.metadata.generation.get_or_insert(1);
        capsule.metadata.resource_version = Some(inner.bump_rv());
        let id = (capsule.namespace().unwrap_or_default(), capsule.name_any());
        inner.capsules.insert(id, capsule.clone());
        capsule
    }

    pub fn capsule(&self, namespace: &str, name: &str) -> Option<Capsule> {
        self.lock().capsules.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> WriteCounts {
        self.lock().counts
    }

    pub fn reset_counts(&self) {
        self.lock().counts = WriteCounts::default();
    }

    /// Persisted writes of this type fail with `Invalid`; dry runs still succeed.
    pub fn fail_writes_for(&self, gvk: GroupVersionKind) {
        self.lock().failing.insert(gvk);
    }

    /// The next real create of `key` loses a race: the object appears (as
    /// submitted, so with the same owner) and the call fails `AlreadyExists`.
    pub fn race_create(&self, key: ObjectKey) {
        self.lock().races.insert(key);
    }

    /// Every real create loses a race.
    pub fn race_every_create(&self, on: bool) {
        self.lock().race_every_create = on;
    }

    /// Capsule status writes fail with `Conflict` while `on`.
    pub fn fail_status_writes(&self, on: bool) {
        self.lock().fail_status = on;
    }

    /// Server-side defaulting applied to every create and update (dry or not).
    pub fn with_defaulter(self, f: impl Fn(&ObjectKey, &mut DynamicObject) + Send + Sync + 'static) -> Self {
        self.lock().defaulter = Some(Arc::new(f));
        self
    }
}

fn key_of(obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
    let gvk = gvk_of(obj).ok_or_else(|| StoreError::Invalid(format!("object {} has no apiVersion/kind", obj.name_any())))?;
    Ok(ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any(), gvk))
}

fn check_failing(inner: &Inner, key: &ObjectKey) -> Result<(), StoreError> {
    if inner.failing.contains(&key.gvk) {
        return Err(StoreError::Invalid(format!("injected failure for {key}")));
    }
    Ok(())
}

fn default_object(inner: &Inner, key: &ObjectKey, obj: &mut DynamicObject) {
    if let Some(f) = &inner.defaulter {
        f(key, obj);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        if inner.objects.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        if !dry_run {
            check_failing(&inner, key)?;
        }

        let mut created = obj.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        created.metadata.generation = Some(1);
        default_object(&inner, key, &mut created);

        if dry_run {
            inner.counts.dry_runs += 1;
            return Ok(created);
        }

        created.metadata.resource_version = Some(inner.bump_rv());
        let raced = inner.races.remove(key) || inner.race_every_create;
        inner.objects.insert(key.clone(), created.clone());
        if raced {
            debug!(object = %key, "create lost injected race");
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        inner.counts.creates += 1;
        Ok(created)
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if Some(rv) != stored.metadata.resource_version.as_deref() {
                return Err(StoreError::Conflict(format!("{key}: resourceVersion {rv} is stale")));
            }
        }
        if !dry_run {
            check_failing(&inner, key)?;
        }

        let mut updated = obj.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.generation = stored.metadata.generation;
        updated.metadata.resource_version = stored.metadata.resource_version.clone();
        // Status belongs to the subresource.
        if let Some(data) = updated.data.as_object_mut() {
            data.remove("status");
            if let Some(status) = stored.data.get("status") {
                data.insert("status".to_string(), status.clone());
            }
        }
        default_object(&inner, key, &mut updated);

        if dry_run {
            inner.counts.dry_runs += 1;
            return Ok(updated);
        }

        if updated.data.get("spec") != stored.data.get("spec") {
            updated.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
        }
        updated.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(key.clone(), updated.clone());
        inner.counts.updates += 1;
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored_uid = inner
            .objects
            .get(key)
            .map(|o| o.metadata.uid.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if obj.metadata.uid.is_some() && obj.metadata.uid != stored_uid {
            return Err(StoreError::Conflict(format!("{key}: uid precondition failed")));
        }
        check_failing(&inner, key)?;
        inner.objects.remove(key);
        inner.counts.deletes += 1;
        Ok(())
    }

    async fn update_capsule_status(&self, capsule: &Capsule) -> Result<Capsule, StoreError> {
        let mut inner = self.lock();
        let id = (capsule.namespace().unwrap_or_default(), capsule.name_any());
        if inner.fail_status {
            return Err(StoreError::Conflict(format!("injected status failure for capsule {}/{}", id.0, id.1)));
        }
        let rv = inner.bump_rv();
        let stored = inner
            .capsules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("capsule {}/{}", id.0, id.1)))?;
        stored.status = capsule.status.clone();
        stored.metadata.resource_version = Some(rv);
        let out = stored.clone();
        inner.counts.status_updates += 1;
        Ok(out)
    }
}
