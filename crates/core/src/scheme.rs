//! Type scheme: which child types a pipeline knows about and how two
//! instances of a type are compared.
//!
//! Both tables are plain values handed to the pipeline at construction, so
//! pipelines with different registrations can coexist in one process.

use std::sync::Arc;

use kube::core::{DynamicObject, GroupVersionKind};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

pub const DEPLOYMENT: (&str, &str, &str) = ("apps", "v1", "Deployment");
pub const SERVICE: (&str, &str, &str) = ("", "v1", "Service");
pub const SERVICE_ACCOUNT: (&str, &str, &str) = ("", "v1", "ServiceAccount");
pub const INGRESS: (&str, &str, &str) = ("networking.k8s.io", "v1", "Ingress");
pub const HORIZONTAL_POD_AUTOSCALER: (&str, &str, &str) = ("autoscaling", "v2", "HorizontalPodAutoscaler");
pub const CRON_JOB: (&str, &str, &str) = ("batch", "v1", "CronJob");
pub const SERVICE_MONITOR: (&str, &str, &str) = ("monitoring.coreos.com", "v1", "ServiceMonitor");

pub fn gvk((group, version, kind): (&str, &str, &str)) -> GroupVersionKind {
    GroupVersionKind::gvk(group, version, kind)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnknownType {
    #[error("unknown apiGroup '{0}'")]
    Group(String),
    #[error("unknown kind '{kind}' in apiGroup '{group}'")]
    Kind { group: String, kind: String },
}

/// Maps `(group, kind)` references, as stored in Capsule status, back to full
/// type descriptors.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    by_group: FxHashMap<String, FxHashMap<String, GroupVersionKind>>,
    // Status written by older operators may lack the group.
    by_kind: FxHashMap<String, GroupVersionKind>,
}

impl TypeRegistry {
    pub fn register(&mut self, gvk: GroupVersionKind) {
        self.by_kind.entry(gvk.kind.clone()).or_insert_with(|| gvk.clone());
        self.by_group
            .entry(gvk.group.clone())
            .or_default()
            .insert(gvk.kind.clone(), gvk);
    }

    pub fn lookup(&self, group: &str, kind: &str) -> Result<GroupVersionKind, UnknownType> {
        if group.is_empty() {
            if let Some(gvk) = self.by_kind.get(kind) {
                return Ok(gvk.clone());
            }
        }
        let kinds = self
            .by_group
            .get(group)
            .ok_or_else(|| UnknownType::Group(group.to_string()))?;
        kinds.get(kind).cloned().ok_or_else(|| UnknownType::Kind {
            group: group.to_string(),
            kind: kind.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.by_group.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-specific equality between the live object and the dry-run
/// materialization of the desired one. Both sides arrive with volatile
/// metadata already stripped.
pub trait ObjectsEqual: Send + Sync {
    fn equal(&self, current: &Json, materialized: &Json) -> bool;
}

/// Default: the whole object must match.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullEquality;

impl ObjectsEqual for FullEquality {
    fn equal(&self, current: &Json, materialized: &Json) -> bool {
        current == materialized
    }
}

/// Compare a single top-level field, e.g. `spec`, ignoring server-populated
/// siblings such as `status`.
#[derive(Debug, Clone, Copy)]
pub struct FieldEquality(pub &'static str);

impl ObjectsEqual for FieldEquality {
    fn equal(&self, current: &Json, materialized: &Json) -> bool {
        current.get(self.0) == materialized.get(self.0)
    }
}

#[derive(Clone, Default)]
pub struct EqualityTable {
    overrides: FxHashMap<GroupVersionKind, Arc<dyn ObjectsEqual>>,
}

impl std::fmt::Debug for EqualityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EqualityTable").field("overrides", &self.overrides.keys().collect::<Vec<_>>()).finish()
    }
}

impl EqualityTable {
    pub fn set(&mut self, gvk: GroupVersionKind, eq: impl ObjectsEqual + 'static) {
        self.overrides.insert(gvk, Arc::new(eq));
    }

    /// Override for `gvk`, or [`FullEquality`].
    pub fn lookup(&self, gvk: &GroupVersionKind) -> &dyn ObjectsEqual {
        match self.overrides.get(gvk) {
            Some(eq) => eq.as_ref(),
            None => &FullEquality,
        }
    }

    pub fn objects_equal(&self, gvk: &GroupVersionKind, current: &DynamicObject, materialized: &DynamicObject) -> bool {
        let (Ok(a), Ok(b)) = (serde_json::to_value(current), serde_json::to_value(materialized)) else {
            return false;
        };
        self.lookup(gvk).equal(&strip_volatile(a), &strip_volatile(b))
    }
}

/// Drop metadata the server rewrites on every write.
pub fn strip_volatile(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
    }
    v
}

/// Registry plus equality table, passed into every pipeline.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    pub types: TypeRegistry,
    pub equality: EqualityTable,
}

impl Scheme {
    /// Types produced by the built-in steps.
    pub fn builtin() -> Self {
        let mut scheme = Self::default();
        for t in [
            DEPLOYMENT,
            SERVICE,
            SERVICE_ACCOUNT,
            INGRESS,
            HORIZONTAL_POD_AUTOSCALER,
            CRON_JOB,
            SERVICE_MONITOR,
        ] {
            scheme.types.register(gvk(t));
        }
        scheme.equality.set(gvk(DEPLOYMENT), FieldEquality("spec"));
        scheme.equality.set(gvk(SERVICE_MONITOR), FieldEquality("spec"));
        scheme
    }

    pub fn register(&mut self, gvk: GroupVersionKind) -> &mut Self {
        self.types.register(gvk);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_registered_types() {
        let s = Scheme::builtin();
        assert_eq!(s.types.lookup("apps", "Deployment").unwrap(), gvk(DEPLOYMENT));
        assert_eq!(s.types.lookup("", "Service").unwrap(), gvk(SERVICE));
        assert_eq!(s.types.len(), 7);
    }

    #[test]
    fn lookup_without_group_falls_back_to_kind() {
        let s = Scheme::builtin();
        assert_eq!(s.types.lookup("", "CronJob").unwrap(), gvk(CRON_JOB));
    }

    #[test]
    fn lookup_unknown_fails() {
        let s = Scheme::builtin();
        assert_eq!(s.types.lookup("example.com", "Widget"), Err(UnknownType::Group("example.com".into())));
        assert_eq!(
            s.types.lookup("apps", "StatefulSet"),
            Err(UnknownType::Kind { group: "apps".into(), kind: "StatefulSet".into() })
        );
        assert!(TypeRegistry::default().lookup("", "Service").is_err());
    }

    fn obj(v: Json) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn full_equality_ignores_volatile_metadata_only() {
        let s = Scheme::builtin();
        let a = obj(serde_json::json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "web", "resourceVersion": "1", "generation": 1 },
            "spec": { "type": "ClusterIP" }
        }));
        let mut b = a.clone();
        b.metadata.resource_version = Some("7".into());
        assert!(s.equality.objects_equal(&gvk(SERVICE), &a, &b));
        b.data["status"] = serde_json::json!({ "loadBalancer": {} });
        assert!(!s.equality.objects_equal(&gvk(SERVICE), &a, &b));
    }

    #[test]
    fn deployment_compares_spec_only() {
        let s = Scheme::builtin();
        let a = obj(serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 2 }
        }));
        let mut b = a.clone();
        b.data["status"] = serde_json::json!({ "readyReplicas": 0 });
        assert!(s.equality.objects_equal(&gvk(DEPLOYMENT), &a, &b));
        b.data["spec"]["replicas"] = serde_json::json!(3);
        assert!(!s.equality.objects_equal(&gvk(DEPLOYMENT), &a, &b));
    }
}
