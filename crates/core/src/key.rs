//! Object identity: (namespace, name, type).

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};

/// Identifies one child resource instance. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
    pub gvk: GroupVersionKind,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, gvk: GroupVersionKind) -> Self {
        Self { namespace: namespace.into(), name: name.into(), gvk }
    }

    /// `apiVersion` as written on the wire (`v1` or `group/v1`).
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }
}

/// Canonical form used for sorting: `group/version/Kind/namespace/name`.
impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", gvk_key(&self.gvk), self.namespace, self.name)
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Type of a dynamic object, read from its `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Some(GroupVersionKind { group, version, kind: types.kind.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    #[test]
    fn display_is_canonical() {
        let k = ObjectKey::new("prod", "web", deployment());
        assert_eq!(k.to_string(), "apps/v1/Deployment/prod/web");
        let svc = ObjectKey::new("prod", "web", GroupVersionKind::gvk("", "v1", "Service"));
        assert_eq!(svc.to_string(), "v1/Service/prod/web");
        assert_eq!(svc.api_version(), "v1");
        assert_eq!(k.api_version(), "apps/v1");
    }

    #[test]
    fn keys_compare_structurally() {
        assert_eq!(ObjectKey::new("a", "b", deployment()), ObjectKey::new("a", "b", deployment()));
        assert_ne!(ObjectKey::new("a", "b", deployment()), ObjectKey::new("a", "c", deployment()));
    }

    #[test]
    fn gvk_of_parses_api_version() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1", "kind": "Deployment", "metadata": { "name": "x" }
        }))
        .unwrap();
        assert_eq!(gvk_of(&obj), Some(deployment()));
        let core: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "x" }
        }))
        .unwrap();
        assert_eq!(gvk_of(&core).unwrap().group, "");
    }
}
