//! The read/write surface steps see during one run.

use std::sync::Arc;

use anyhow::Context;
use capsule_core::{Capsule, ObjectKey, OperatorConfig, Scheme, UsedResource};
use capsule_kubehub::ObjectStore;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::ledger::Ledger;

/// Ledger access for steps, scoped to the Capsule under reconciliation.
///
/// `get_*` and `list_*` return copies. `set` and `delete` only touch the
/// ledger; nothing reaches the store before commit.
pub trait Request: Send {
    fn capsule(&self) -> &Capsule;
    fn config(&self) -> &OperatorConfig;
    fn scheme(&self) -> &Scheme;
    /// Read access to the cluster for resources the Capsule uses but does not own.
    fn store(&self) -> Arc<dyn ObjectStore>;

    fn get_current(&self, key: &ObjectKey) -> Option<DynamicObject>;
    fn get_new(&self, key: &ObjectKey) -> Option<DynamicObject>;
    fn set(&mut self, key: ObjectKey, obj: DynamicObject);
    fn delete(&mut self, key: &ObjectKey);
    fn list_current(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject>;
    fn list_new(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject>;

    fn named_key(&self, name: &str, gvk: GroupVersionKind) -> ObjectKey {
        ObjectKey::new(self.capsule().namespace().unwrap_or_default(), name, gvk)
    }

    fn key(&self, gvk: GroupVersionKind) -> ObjectKey {
        self.named_key(&self.capsule().name_any(), gvk)
    }

    fn mark_used_resource(&mut self, res: UsedResource);
}

pub struct CapsuleRequest {
    pub(crate) capsule: Capsule,
    pub(crate) config: Arc<OperatorConfig>,
    pub(crate) scheme: Arc<Scheme>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) ledger: Ledger,
    pub(crate) used: Vec<UsedResource>,
    /// Generation remembered from the last fully successful commit.
    pub(crate) observed_generation: i64,
    /// Owned objects found changed underneath this attempt.
    pub(crate) absorbed: Vec<(ObjectKey, DynamicObject)>,
    /// What this attempt's writes left in the store; `None` after a delete.
    pub(crate) written: Vec<(ObjectKey, Option<DynamicObject>)>,
}

impl CapsuleRequest {
    pub fn new(capsule: Capsule, config: Arc<OperatorConfig>, scheme: Arc<Scheme>, store: Arc<dyn ObjectStore>) -> Self {
        let observed_generation = capsule.observed_generation();
        Self {
            capsule,
            config,
            scheme,
            store,
            ledger: Ledger::default(),
            used: Vec::new(),
            observed_generation,
            absorbed: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn with_current<'a>(mut self, current: impl IntoIterator<Item = (&'a ObjectKey, &'a DynamicObject)>) -> Self {
        self.ledger = Ledger::seeded(current);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn used_resources(&self) -> &[UsedResource] {
        &self.used
    }
}

impl Request for CapsuleRequest {
    fn capsule(&self) -> &Capsule {
        &self.capsule
    }

    fn config(&self) -> &OperatorConfig {
        &self.config
    }

    fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    fn get_current(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.ledger.get_current(key)
    }

    fn get_new(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.ledger.get_new(key)
    }

    fn set(&mut self, key: ObjectKey, mut obj: DynamicObject) {
        normalize(&key, &mut obj);
        self.ledger.set(key, obj);
    }

    fn delete(&mut self, key: &ObjectKey) {
        self.ledger.delete(key);
    }

    fn list_current(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.ledger.list_current(gvk)
    }

    fn list_new(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.ledger.list_new(gvk)
    }

    fn mark_used_resource(&mut self, res: UsedResource) {
        self.used.push(res);
    }
}

/// Make `obj` agree with `key` on identity and drop server bookkeeping.
pub(crate) fn normalize(key: &ObjectKey, obj: &mut DynamicObject) {
    obj.types = Some(TypeMeta { api_version: key.api_version(), kind: key.gvk.kind.clone() });
    obj.metadata.name = Some(key.name.clone());
    obj.metadata.namespace = Some(key.namespace.clone());
    obj.metadata.managed_fields = None;
}

pub fn gvk_for<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> serde_json::Result<DynamicObject> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> serde_json::Result<K> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Typed access on top of [`Request`] for k8s-openapi types.
pub trait RequestExt: Request {
    fn current_as<K: DeserializeOwned>(&self, key: &ObjectKey) -> anyhow::Result<Option<K>> {
        self.get_current(key)
            .map(|o| from_dynamic(&o))
            .transpose()
            .with_context(|| format!("decoding current {key}"))
    }

    fn new_as<K: DeserializeOwned>(&self, key: &ObjectKey) -> anyhow::Result<Option<K>> {
        self.get_new(key)
            .map(|o| from_dynamic(&o))
            .transpose()
            .with_context(|| format!("decoding new {key}"))
    }

    /// Record `obj` as desired. Its name defaults to the Capsule's.
    fn set_object<K>(&mut self, obj: &K) -> anyhow::Result<ObjectKey>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let name = obj.meta().name.clone().unwrap_or_else(|| self.capsule().name_any());
        let key = self.named_key(&name, gvk_for::<K>());
        let dynamic = to_dynamic(obj).with_context(|| format!("encoding {key}"))?;
        self.set(key.clone(), dynamic);
        Ok(key)
    }
}

impl<R: Request + ?Sized> RequestExt for R {}
