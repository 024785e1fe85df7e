//! Per-run object ledger: for every touched key, the last observed object and
//! the desired one. Reads hand out copies; writes store the caller's value, so
//! a step never holds a live reference into the ledger.

use capsule_core::ObjectKey;
use kube::core::{DynamicObject, GroupVersionKind};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Default)]
pub struct LedgerEntry {
    pub current: Option<DynamicObject>,
    pub new: Option<DynamicObject>,
    /// Dry-run result for a key classified created/updated.
    pub materialized: Option<DynamicObject>,
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: FxHashMap<ObjectKey, LedgerEntry>,
}

impl Ledger {
    /// Fresh ledger whose `Current` values are copies of `current`.
    pub fn seeded<'a>(current: impl IntoIterator<Item = (&'a ObjectKey, &'a DynamicObject)>) -> Self {
        let entries = current
            .into_iter()
            .map(|(k, o)| (k.clone(), LedgerEntry { current: Some(o.clone()), ..LedgerEntry::default() }))
            .collect();
        Self { entries }
    }

    pub fn get_current(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.entries.get(key).and_then(|e| e.current.clone())
    }

    pub fn get_new(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.entries.get(key).and_then(|e| e.new.clone())
    }

    /// Last write wins.
    pub fn set(&mut self, key: ObjectKey, obj: DynamicObject) {
        self.entries.entry(key).or_default().new = Some(obj);
    }

    /// Drop the desired state. An untouched key stays untouched.
    pub fn delete(&mut self, key: &ObjectKey) {
        if let Some(e) = self.entries.get_mut(key) {
            e.new = None;
        }
    }

    pub fn entry(&self, key: &ObjectKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &ObjectKey) -> Option<&mut LedgerEntry> {
        self.entries.get_mut(key)
    }

    /// All keys in canonical order.
    pub fn keys(&self) -> Vec<ObjectKey> {
        sorted_keys(self.entries.keys())
    }

    pub fn list_current(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.list(gvk, |e| e.current.as_ref())
    }

    pub fn list_new(&self, gvk: &GroupVersionKind) -> Vec<DynamicObject> {
        self.list(gvk, |e| e.new.as_ref())
    }

    fn list(&self, gvk: &GroupVersionKind, pick: impl Fn(&LedgerEntry) -> Option<&DynamicObject>) -> Vec<DynamicObject> {
        sorted_keys(self.entries.keys().filter(|k| &k.gvk == gvk))
            .iter()
            .filter_map(|k| self.entries.get(k).and_then(&pick).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sort by the `Display` form of the key.
pub fn sorted_keys<'a>(keys: impl IntoIterator<Item = &'a ObjectKey>) -> Vec<ObjectKey> {
    let mut keyed: Vec<(String, ObjectKey)> = keys.into_iter().map(|k| (k.to_string(), k.clone())).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, k)| k).collect()
}
