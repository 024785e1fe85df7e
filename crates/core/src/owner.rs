//! Ownership marker: a controller owner reference from a child to its Capsule.
//!
//! [`is_owned_by`] is the only authority the commit protocol consults before
//! mutating or deleting an object that already exists.

use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};

use crate::{Capsule, LABEL_OWNED_BY_CAPSULE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnerError {
    #[error("capsule {0} has no uid")]
    MissingUid(String),
    #[error("cross-namespace owner reference: capsule in '{capsule}', object in '{object}'")]
    CrossNamespace { capsule: String, object: String },
    #[error("object {object} is already controlled by {kind} {name}")]
    AlreadyControlled { object: String, kind: String, name: String },
}

pub fn is_owned_by(capsule: &Capsule, obj: &DynamicObject) -> bool {
    let Some(uid) = capsule.meta().uid.as_deref() else {
        return false;
    };
    obj.owner_references()
        .iter()
        .any(|r| r.uid == uid && r.controller == Some(true))
}

/// Attach the controller reference and the owned-by label to `child`.
/// Idempotent for a child already controlled by `capsule`.
pub fn set_owner(capsule: &Capsule, child: &mut DynamicObject) -> Result<(), OwnerError> {
    let owner = capsule
        .controller_owner_ref(&())
        .ok_or_else(|| OwnerError::MissingUid(capsule.name_any()))?;

    let capsule_ns = capsule.namespace().unwrap_or_default();
    let child_ns = child.namespace().unwrap_or_default();
    if child_ns != capsule_ns {
        return Err(OwnerError::CrossNamespace { capsule: capsule_ns, object: child_ns });
    }

    let child_name = child.name_any();
    let refs = child.owner_references_mut();
    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(OwnerError::AlreadyControlled {
            object: child_name,
            kind: other.kind.clone(),
            name: other.name.clone(),
        });
    }
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner);

    child
        .labels_mut()
        .insert(LABEL_OWNED_BY_CAPSULE.to_string(), capsule.name_any());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CapsuleSpec;

    fn capsule(uid: Option<&str>) -> Capsule {
        let mut c = Capsule::new("web", CapsuleSpec::default());
        c.metadata.namespace = Some("prod".into());
        c.metadata.uid = uid.map(str::to_string);
        c
    }

    fn child(ns: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ServiceAccount",
            "metadata": { "name": "web", "namespace": ns }
        }))
        .unwrap()
    }

    #[test]
    fn set_owner_marks_child() {
        let c = capsule(Some("uid-1"));
        let mut o = child("prod");
        assert!(!is_owned_by(&c, &o));
        set_owner(&c, &mut o).unwrap();
        assert!(is_owned_by(&c, &o));
        assert_eq!(o.labels().get(LABEL_OWNED_BY_CAPSULE).map(String::as_str), Some("web"));

        set_owner(&c, &mut o).unwrap();
        assert_eq!(o.owner_references().len(), 1);
    }

    #[test]
    fn set_owner_rejects_unconvertible_pairs() {
        let mut o = child("prod");
        assert_eq!(set_owner(&capsule(None), &mut o), Err(OwnerError::MissingUid("web".into())));

        let mut other_ns = child("dev");
        assert!(matches!(
            set_owner(&capsule(Some("uid-1")), &mut other_ns),
            Err(OwnerError::CrossNamespace { .. })
        ));

        let mut taken = child("prod");
        set_owner(&capsule(Some("uid-2")), &mut taken).unwrap();
        assert!(matches!(
            set_owner(&capsule(Some("uid-1")), &mut taken),
            Err(OwnerError::AlreadyControlled { .. })
        ));
    }

    #[test]
    fn capsule_without_uid_owns_nothing() {
        let mut o = child("prod");
        set_owner(&capsule(Some("uid-1")), &mut o).unwrap();
        assert!(!is_owned_by(&capsule(None), &o));
        assert!(!is_owned_by(&capsule(Some("uid-9")), &o));
    }
}
