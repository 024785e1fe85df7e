//! Capsule pipeline: runs the configured steps against a per-run ledger,
//! commits the result through dry-run classification and publishes what
//! happened on the Capsule status.
//!
//! A run re-executes every step from scratch whenever it finds an owned
//! object changed underneath it, either through a lost create race or a
//! conflicting dry-run update. Objects written by the failed attempt carry
//! over as current. The number of attempts is bounded by the number of
//! distinct keys seen plus one, and by `pipeline.maxAttempts`.

#![forbid(unsafe_code)]

mod commit;
mod error;
pub mod ledger;
mod request;
pub mod status;
mod step;

use std::sync::Arc;
use std::time::Instant;

use capsule_core::{Capsule, ObjectKey, OperatorConfig, ResourceState, Scheme};
use capsule_kubehub::{get_opt, ObjectStore};
use kube::core::DynamicObject;
use kube::ResourceExt;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, info_span, warn, Instrument};

pub use error::{ApplyErrors, PipelineError};
pub use ledger::{Ledger, LedgerEntry};
pub use request::{from_dynamic, gvk_for, to_dynamic, CapsuleRequest, Request, RequestExt};
pub use status::{Change, Changes};
pub use step::Step;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run steps and classification only: no writes, not even status.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct OutputObject {
    pub key: ObjectKey,
    /// Dry-run materialization when there is one, else the desired object,
    /// else (for deletes) the current one.
    pub object: Option<DynamicObject>,
    pub state: ResourceState,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The Capsule as last written by this run.
    pub capsule: Capsule,
    pub attempts: usize,
    pub input_objects: Vec<DynamicObject>,
    pub output_objects: Vec<OutputObject>,
}

impl RunOutcome {
    pub fn state_of(&self, key: &ObjectKey) -> Option<ResourceState> {
        self.output_objects.iter().find(|o| &o.key == key).map(|o| o.state)
    }
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    scheme: Arc<Scheme>,
    config: Arc<OperatorConfig>,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ObjectStore>, scheme: Arc<Scheme>, config: Arc<OperatorConfig>) -> Self {
        Self { store, scheme, config, steps: Vec::new() }
    }

    pub fn add_step(&mut self, step: Arc<dyn Step>) {
        self.steps.push(step);
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub async fn run(&self, capsule: Capsule) -> Result<RunOutcome, PipelineError> {
        self.run_with(capsule, RunOptions::default()).await
    }

    pub async fn run_with(&self, capsule: Capsule, opts: RunOptions) -> Result<RunOutcome, PipelineError> {
        self.instrumented(capsule, opts, &self.steps, "reconcile").await
    }

    /// Commit with no steps: every owned child from the last published
    /// status classifies `deleted`, anything not owned is left alone.
    pub async fn delete_capsule(&self, capsule: Capsule, opts: RunOptions) -> Result<RunOutcome, PipelineError> {
        self.instrumented(capsule, opts, &[], "delete").await
    }

    async fn instrumented(
        &self,
        capsule: Capsule,
        opts: RunOptions,
        steps: &[Arc<dyn Step>],
        op: &'static str,
    ) -> Result<RunOutcome, PipelineError> {
        let span = info_span!(
            "capsule",
            op,
            ns = %capsule.namespace().unwrap_or_default(),
            name = %capsule.name_any(),
            generation = capsule.generation(),
        );
        async move {
            counter!("pipeline_runs_total", 1u64, "op" => op);
            let t0 = Instant::now();
            let res = self.execute(capsule, opts, steps).await;
            histogram!("pipeline_run_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            match &res {
                Ok(outcome) => {
                    counter!("pipeline_run_ok", 1u64);
                    info!(attempts = outcome.attempts, objects = outcome.output_objects.len(), "run complete");
                }
                Err(e) => {
                    counter!("pipeline_run_err", 1u64, "kind" => e.kind());
                    warn!(error = %e, "run failed");
                }
            }
            res
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, mut capsule: Capsule, opts: RunOptions, steps: &[Arc<dyn Step>]) -> Result<RunOutcome, PipelineError> {
        let observed = capsule.observed_generation();
        let mut current = match self.load_current(&capsule).await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(&mut capsule, observed, e, opts).await),
        };
        let mut seen: FxHashSet<ObjectKey> = current.keys().cloned().collect();
        let max_attempts = self.config.pipeline.max_attempts.max(1);

        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts > seen.len() + 1 || attempts > max_attempts {
                let e = PipelineError::RetryExhausted { attempts: attempts - 1, seen: seen.len() };
                return Err(self.fail(&mut capsule, observed, e, opts).await);
            }

            let input_objects: Vec<DynamicObject> = ledger::sorted_keys(current.keys())
                .iter()
                .filter_map(|k| current.get(k).cloned())
                .collect();
            let mut req = CapsuleRequest::new(capsule, self.config.clone(), self.scheme.clone(), self.store.clone())
                .with_current(current.iter());

            info!(attempt = attempts, existing = current.len(), "run steps");
            for step in steps {
                debug!(step = step.name(), "apply step");
                if let Err(error) = step.apply(&mut req).await {
                    let e = PipelineError::Step { step: step.name().to_string(), error };
                    return Err(self.fail(&mut req.capsule, observed, e, opts).await);
                }
            }
            seen.extend(req.ledger.keys());

            match req.commit(opts.dry_run).await {
                Ok(changes) => {
                    let output_objects = changes
                        .into_iter()
                        .map(|(key, change)| {
                            let object = req
                                .ledger
                                .entry(&key)
                                .and_then(|e| e.materialized.clone().or_else(|| e.new.clone()).or_else(|| e.current.clone()));
                            OutputObject { key, object, state: change.state }
                        })
                        .collect();
                    return Ok(RunOutcome { capsule: req.capsule, attempts, input_objects, output_objects });
                }
                Err(PipelineError::RecoverableConflict(key)) => {
                    counter!("pipeline_conflict_retries_total", 1u64);
                    warn!(object = %key, "retry running steps");
                    for (k, o) in req.written.drain(..) {
                        match o {
                            Some(o) => current.insert(k, o),
                            None => current.remove(&k),
                        };
                    }
                    for (k, o) in req.absorbed.drain(..) {
                        seen.insert(k.clone());
                        current.insert(k, o);
                    }
                    capsule = req.capsule;
                }
                Err(e) => return Err(self.fail(&mut req.capsule, observed, e, opts).await),
            }
        }
    }

    /// Resolve the previously published owned resources to live objects.
    async fn load_current(&self, capsule: &Capsule) -> Result<FxHashMap<ObjectKey, DynamicObject>, PipelineError> {
        let mut current = FxHashMap::default();
        let Some(status) = capsule.status.as_ref() else {
            return Ok(current);
        };
        let ns = capsule.namespace().unwrap_or_default();
        for owned in &status.owned_resources {
            let Some(r) = owned.r#ref.as_ref() else {
                continue;
            };
            let gvk = self.scheme.types.lookup(r.api_group.as_deref().unwrap_or_default(), &r.kind)?;
            let key = ObjectKey::new(ns.clone(), r.name.clone(), gvk);
            match get_opt(self.store.as_ref(), &key).await {
                Ok(Some(mut obj)) => {
                    request::normalize(&key, &mut obj);
                    current.insert(key, obj);
                }
                Ok(None) => debug!(object = %key, "owned object no longer exists"),
                Err(error) => return Err(PipelineError::Load { key: key.to_string(), error }),
            }
        }
        Ok(current)
    }

    /// Record `err` on the Capsule when it calls for it. A failing status
    /// write replaces `err`.
    async fn fail(&self, capsule: &mut Capsule, observed: i64, err: PipelineError, opts: RunOptions) -> PipelineError {
        if opts.dry_run || !err.publishes_status() {
            return err;
        }
        let status = status::from_error(capsule.status.as_ref(), observed, &err);
        match status::publish(self.store.as_ref(), capsule, status).await {
            Ok(()) => err,
            Err(publish) => publish,
        }
    }
}
