//! Builds and writes the Capsule status.

use capsule_core::{Capsule, CapsuleStatus, ObjectKey, OwnedResource, ResourceState, UsedResource};
use capsule_kubehub::ObjectStore;
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use tracing::debug;

use crate::PipelineError;

/// Classification of one key in one commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub state: ResourceState,
    pub applied: bool,
    pub error: Option<String>,
}

impl Change {
    pub fn new(state: ResourceState) -> Self {
        Self { state, applied: false, error: None }
    }

    /// Mutations that have not been applied show as `changePending`.
    pub fn published_state(&self) -> ResourceState {
        if self.state.is_mutation() && !self.applied {
            ResourceState::ChangePending
        } else {
            self.state
        }
    }
}

/// Changes in canonical key order.
pub type Changes = Vec<(ObjectKey, Change)>;

pub(crate) fn owned_resource(key: &ObjectKey, change: &Change) -> OwnedResource {
    OwnedResource {
        r#ref: Some(TypedLocalObjectReference {
            api_group: (!key.gvk.group.is_empty()).then(|| key.gvk.group.clone()),
            kind: key.gvk.kind.clone(),
            name: key.name.clone(),
        }),
        state: change.published_state().as_str().to_string(),
        message: change.error.clone(),
    }
}

pub(crate) fn from_changes(changes: &Changes, used: &[UsedResource], generation: i64) -> CapsuleStatus {
    CapsuleStatus {
        observed_generation: generation,
        owned_resources: changes.iter().map(|(k, c)| owned_resource(k, c)).collect(),
        used_resources: used.to_vec(),
        errors: changes.iter().filter_map(|(_, c)| c.error.clone()).collect(),
    }
}

/// Keep what the last commit published and only record the error.
pub(crate) fn from_error(prior: Option<&CapsuleStatus>, observed_generation: i64, err: &PipelineError) -> CapsuleStatus {
    let prior = prior.cloned().unwrap_or_default();
    CapsuleStatus {
        observed_generation,
        owned_resources: prior.owned_resources,
        used_resources: prior.used_resources,
        errors: vec![err.to_string()],
    }
}

/// Write `status` and keep `capsule` in step with what the store returned.
pub(crate) async fn publish(store: &dyn ObjectStore, capsule: &mut Capsule, status: CapsuleStatus) -> Result<(), PipelineError> {
    let mut next = capsule.clone();
    next.status = Some(status);
    let stored = store.update_capsule_status(&next).await.map_err(PipelineError::Publish)?;
    debug!(
        generation = next.status.as_ref().map(|s| s.observed_generation),
        owned = next.status.as_ref().map(|s| s.owned_resources.len()),
        "status published"
    );
    capsule.status = next.status;
    capsule.metadata.resource_version = stored.metadata.resource_version;
    Ok(())
}
