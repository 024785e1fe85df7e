//! Commit protocol: classify every ledger key through dry runs, publish the
//! plan, apply it key by key, then publish the outcome.
//!
//! An existing object is only ever written when it carries this Capsule's
//! controller reference. Anything else classifies `alreadyExists` and is left
//! alone, whatever the steps asked for.

use capsule_core::scheme::{gvk, DEPLOYMENT};
use capsule_core::{is_owned_by, set_owner, ObjectKey, ResourceState};
use capsule_kubehub::{get_opt, StoreError};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{info, warn};

use crate::request::{normalize, CapsuleRequest};
use crate::status::{self, Change, Changes};
use crate::{ApplyErrors, PipelineError};

impl CapsuleRequest {
    /// Returns the classified changes. In `dry_run` nothing is written, not
    /// even status.
    pub(crate) async fn commit(&mut self, dry_run: bool) -> Result<Changes, PipelineError> {
        let keys = self.ledger.keys();

        for key in &keys {
            if let Some(new) = self.ledger.entry_mut(key).and_then(|e| e.new.as_mut()) {
                set_owner(&self.capsule, new).map_err(|error| PipelineError::Owner { key: key.to_string(), error })?;
            }
        }

        let mut changes = Changes::with_capacity(keys.len());
        for key in keys {
            if let Some(state) = self.classify(&key).await? {
                changes.push((key, Change::new(state)));
            }
        }

        if dry_run {
            return Ok(changes);
        }

        let has_mutations = changes.iter().any(|(_, c)| c.state.is_mutation());
        let clean = self.capsule.status.as_ref().map_or(true, |s| s.errors.is_empty());
        if !has_mutations && clean && self.observed_generation == self.capsule.generation() {
            info!(generation = self.observed_generation, "no changes to apply");
            return Ok(changes);
        }

        if has_mutations {
            let plan = status::from_changes(&changes, &self.used, self.observed_generation);
            status::publish(self.store.as_ref(), &mut self.capsule, plan).await?;
        }

        let mut errors = Vec::new();
        for (key, change) in changes.iter_mut() {
            match self.apply_change(key, change.state).await {
                Ok(applied) => change.applied = applied,
                Err(e) => {
                    warn!(object = %key, error = %e, "apply failed");
                    change.error = Some(e.clone());
                    errors.push(e);
                }
            }
        }

        if let Some((key, _)) = self.absorbed.first() {
            return Err(PipelineError::RecoverableConflict(key.to_string()));
        }

        if !errors.is_empty() {
            let failed = status::from_changes(&changes, &self.used, self.observed_generation);
            status::publish(self.store.as_ref(), &mut self.capsule, failed).await?;
            return Err(PipelineError::Apply(ApplyErrors(errors)));
        }

        let generation = self.capsule.generation();
        let done = status::from_changes(&changes, &self.used, generation);
        status::publish(self.store.as_ref(), &mut self.capsule, done).await?;
        self.observed_generation = generation;
        for (_, change) in &changes {
            counter!("pipeline_objects_total", 1u64, "state" => change.state.as_str());
        }
        Ok(changes)
    }

    /// `None` for a key with neither a current nor a desired object.
    async fn classify(&mut self, key: &ObjectKey) -> Result<Option<ResourceState>, PipelineError> {
        let Some(entry) = self.ledger.entry(key) else {
            return Ok(None);
        };
        let (current, new) = (entry.current.clone(), entry.new.clone());

        let current = match (current, new.as_ref()) {
            (None, None) => return Ok(None),
            (None, Some(new)) => return self.classify_create(key, new).await,
            (Some(current), _) => current,
        };

        if !is_owned_by(&self.capsule, &current) {
            if new.is_none() {
                warn!(object = %key, "delete skipped, not owned by capsule");
            } else {
                info!(object = %key, "update skipped, not owned by capsule");
            }
            return Ok(Some(ResourceState::AlreadyExists));
        }

        let Some(mut candidate) = new else {
            info!(object = %key, "delete object");
            return Ok(Some(ResourceState::Deleted));
        };
        candidate.metadata.resource_version = current.metadata.resource_version.clone();
        let materialized = match self.store.update(key, &candidate, true).await {
            Ok(o) => o,
            Err(e) if e.is_conflict() => return Err(self.reload(key, e).await),
            Err(error) => return Err(PipelineError::Render { key: key.to_string(), error }),
        };

        if self.scheme.equality.objects_equal(&key.gvk, &current, &materialized) {
            info!(object = %key, "update skipped, not changed");
            return Ok(Some(ResourceState::Unchanged));
        }
        self.remember_materialized(key, materialized);
        info!(object = %key, "update object");
        Ok(Some(ResourceState::Updated))
    }

    async fn classify_create(&mut self, key: &ObjectKey, new: &DynamicObject) -> Result<Option<ResourceState>, PipelineError> {
        let error = match self.store.create(key, new, true).await {
            Ok(materialized) => {
                self.remember_materialized(key, materialized);
                info!(object = %key, "create object");
                return Ok(Some(ResourceState::Created));
            }
            Err(e) if e.is_conflict() => return Err(PipelineError::Stale(key.to_string())),
            Err(e) if e.is_already_exists() || matches!(e, StoreError::Invalid(_)) => e,
            Err(error) => return Err(PipelineError::Render { key: key.to_string(), error }),
        };

        let existing = match get_opt(self.store.as_ref(), key).await {
            Ok(Some(o)) => o,
            Ok(None) => {
                info!(object = %key, error = %error, "configuration is invalid");
                return Err(PipelineError::Render { key: key.to_string(), error });
            }
            Err(error) => return Err(PipelineError::Load { key: key.to_string(), error }),
        };

        if is_owned_by(&self.capsule, &existing) {
            info!(object = %key, "object exists but not in status, retrying");
            self.absorb(key, existing);
            return Err(PipelineError::RecoverableConflict(key.to_string()));
        }
        info!(object = %key, "create skipped, not owned by capsule");
        Ok(Some(ResourceState::AlreadyExists))
    }

    /// Our copy of `key` is behind the store. Owned objects are taken as the
    /// new current and the run retried; anything else is stale.
    async fn reload(&mut self, key: &ObjectKey, error: StoreError) -> PipelineError {
        match get_opt(self.store.as_ref(), key).await {
            Ok(Some(latest)) if is_owned_by(&self.capsule, &latest) => {
                info!(object = %key, "current version changed, retrying");
                self.absorb(key, latest);
                PipelineError::RecoverableConflict(key.to_string())
            }
            Ok(Some(_)) => PipelineError::Stale(key.to_string()),
            Ok(None) => {
                info!(object = %key, error = %error, "configuration is invalid");
                PipelineError::Render { key: key.to_string(), error }
            }
            Err(error) => PipelineError::Load { key: key.to_string(), error },
        }
    }

    /// `Ok(true)` when a write was issued and succeeded.
    async fn apply_change(&mut self, key: &ObjectKey, state: ResourceState) -> Result<bool, String> {
        let Some(entry) = self.ledger.entry(key) else {
            return Ok(false);
        };
        let (current, new) = (entry.current.clone(), entry.new.clone());
        match (state, current, new) {
            (ResourceState::Created, _, Some(new)) => match self.store.create(key, &new, false).await {
                Ok(stored) => {
                    self.wrote(key, Some(stored));
                    Ok(true)
                }
                Err(e) => self.lost_create(key, e).await,
            },
            (ResourceState::Updated, Some(current), Some(mut new)) => {
                if key.gvk == gvk(DEPLOYMENT) {
                    self.hold_replicas(key, &current, &mut new);
                }
                new.metadata.resource_version = current.metadata.resource_version;
                let stored = self.store.update(key, &new, false).await.map_err(|e| format!("could not update {key}: {e}"))?;
                self.wrote(key, Some(stored));
                Ok(true)
            }
            (ResourceState::Deleted, Some(current), _) => {
                match self.store.delete(key, &current).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(format!("could not delete {key}: {e}")),
                }
                self.wrote(key, None);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A pod template change goes out at the current replica count so only
    /// the new ReplicaSet is scaled. The scale follows on the next run.
    fn hold_replicas(&self, key: &ObjectKey, current: &DynamicObject, new: &mut DynamicObject) {
        let Some(materialized) = self.ledger.entry(key).and_then(|e| e.materialized.as_ref()) else {
            return;
        };
        let template = |o: &DynamicObject| o.data.get("spec").and_then(|s| s.get("template")).cloned();
        if template(current) == template(materialized) {
            return;
        }
        let Some(spec) = new.data.get_mut("spec").and_then(|s| s.as_object_mut()) else {
            return;
        };
        match current.data.get("spec").and_then(|s| s.get("replicas")) {
            Some(replicas) => {
                spec.insert("replicas".to_string(), replicas.clone());
            }
            None => {
                spec.remove("replicas");
            }
        }
        info!(object = %key, "pod template changed, holding replicas");
    }

    /// A failed create is a race when the object now exists and is ours.
    async fn lost_create(&mut self, key: &ObjectKey, error: StoreError) -> Result<bool, String> {
        match get_opt(self.store.as_ref(), key).await {
            Ok(Some(existing)) if is_owned_by(&self.capsule, &existing) => {
                info!(object = %key, "create raced with another run");
                self.absorb(key, existing);
                Ok(false)
            }
            _ => Err(format!("could not create {key}: {error}")),
        }
    }

    fn absorb(&mut self, key: &ObjectKey, mut obj: DynamicObject) {
        normalize(key, &mut obj);
        self.absorbed.push((key.clone(), obj));
    }

    fn wrote(&mut self, key: &ObjectKey, mut obj: Option<DynamicObject>) {
        if let Some(o) = obj.as_mut() {
            normalize(key, o);
        }
        self.written.push((key.clone(), obj));
    }

    fn remember_materialized(&mut self, key: &ObjectKey, mut obj: DynamicObject) {
        normalize(key, &mut obj);
        if let Some(entry) = self.ledger.entry_mut(key) {
            entry.materialized = Some(obj);
        }
    }
}
