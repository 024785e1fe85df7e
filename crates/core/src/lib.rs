//! Capsule core types: the Capsule resource, object identity, the type scheme
//! (registry + equality table) and the ownership marker.

#![forbid(unsafe_code)]

pub mod capsule;
pub mod config;
pub mod key;
pub mod owner;
pub mod scheme;

pub use capsule::{
    Capsule, CapsuleSpec, CapsuleStatus, OwnedResource, ResourceState, UsedResource,
};
pub use config::OperatorConfig;
pub use key::{gvk_key, gvk_of, ObjectKey};
pub use owner::{is_owned_by, set_owner, OwnerError};
pub use scheme::{EqualityTable, ObjectsEqual, Scheme, TypeRegistry, UnknownType};

/// Label put on every object the pipeline writes, valued with the Capsule name.
pub const LABEL_OWNED_BY_CAPSULE: &str = "capsule.dev/owned-by-capsule";

/// Selector label shared by a Capsule's pods and the services fronting them.
pub const LABEL_CAPSULE: &str = "capsule.dev/capsule";

pub mod prelude {
    pub use super::{
        Capsule, CapsuleSpec, CapsuleStatus, ObjectKey, OperatorConfig, OwnedResource,
        ResourceState, Scheme, UsedResource,
    };
}
