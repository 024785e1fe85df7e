#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use capsule_core::capsule::{
    CapsuleInterface, CpuTarget, CronJob, Env, EnvReference, HorizontalScale, Instances, InterfaceProbe, JobUrl,
    PublicInterface, IngressInterface,
};
use capsule_core::{Capsule, CapsuleSpec, ObjectKey, OperatorConfig, ResourceState, Scheme};
use capsule_kubehub::{MemoryStore, ObjectStore};
use capsule_pipeline::{gvk_for, Pipeline, PipelineError, RunOptions};
use capsule_steps::default_pipeline;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob as BatchCronJob;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;

fn spec() -> CapsuleSpec {
    CapsuleSpec {
        image: "ghcr.io/acme/web:1.0".into(),
        interfaces: vec![CapsuleInterface {
            name: "http".into(),
            port: 8080,
            readiness: Some(InterfaceProbe { path: Some("/ready".into()), ..Default::default() }),
            public: Some(PublicInterface {
                ingress: Some(IngressInterface { host: "web.acme.dev".into(), path_prefixes: vec!["/api".into()] }),
                load_balancer: None,
            }),
            ..Default::default()
        }],
        scale: capsule_core::capsule::CapsuleScale {
            horizontal: HorizontalScale {
                instances: Instances { min: 2, max: Some(6) },
                cpu_target: Some(CpuTarget { utilization: 75 }),
            },
            vertical: None,
        },
        cron_jobs: vec![CronJob {
            name: "ping".into(),
            schedule: "*/10 * * * *".into(),
            url: Some(JobUrl { port: 8080, path: "/ping".into(), query_parameters: BTreeMap::new() }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn setup(spec: CapsuleSpec) -> (Arc<MemoryStore>, Pipeline, Capsule) {
    let store = Arc::new(MemoryStore::new());
    let mut c = Capsule::new("web", spec);
    c.metadata.namespace = Some("prod".into());
    let capsule = store.insert_capsule(c);
    let pipeline = default_pipeline(
        store.clone() as Arc<dyn ObjectStore>,
        Arc::new(Scheme::builtin()),
        Arc::new(OperatorConfig::default()),
    )
    .unwrap();
    (store, pipeline, capsule)
}

fn key<K: kube::Resource<DynamicType = ()>>(name: &str) -> ObjectKey {
    ObjectKey::new("prod", name, gvk_for::<K>())
}

#[tokio::test]
async fn first_run_creates_then_settles() {
    let (store, pipeline, capsule) = setup(spec());

    let outcome = pipeline.run(capsule).await.unwrap();
    for k in [
        key::<Deployment>("web"),
        key::<ServiceAccount>("web"),
        key::<Service>("web"),
        key::<Ingress>("web-http"),
        key::<HorizontalPodAutoscaler>("web"),
        key::<BatchCronJob>("web-ping"),
    ] {
        assert_eq!(outcome.state_of(&k), Some(ResourceState::Created), "{k}");
        assert!(store.object(&k).is_some(), "{k} stored");
    }
    assert_eq!(store.counts().creates, 6);

    let status = outcome.capsule.status.clone().unwrap();
    assert_eq!(status.observed_generation, 1);
    assert_eq!(status.owned_resources.len(), 6);
    assert!(status.errors.is_empty());
    assert_eq!(status.used_resources.len(), 2);
    assert!(status.used_resources.iter().all(|u| u.state == "missing"));

    store.reset_counts();
    let again = pipeline.run(outcome.capsule).await.unwrap();
    assert_eq!(store.counts().mutations(), 0);
    assert_eq!(store.counts().status_updates, 0);
    assert!(again.output_objects.iter().all(|o| o.state == ResourceState::Unchanged));
}

#[tokio::test]
async fn removed_job_is_deleted() {
    let (store, pipeline, capsule) = setup(spec());
    let outcome = pipeline.run(capsule).await.unwrap();

    let mut changed = outcome.capsule;
    changed.spec.cron_jobs.clear();
    changed.metadata.generation = Some(2);
    let changed = store.insert_capsule(changed);

    store.reset_counts();
    let outcome = pipeline.run(changed).await.unwrap();
    assert_eq!(outcome.state_of(&key::<BatchCronJob>("web-ping")), Some(ResourceState::Deleted));
    assert_eq!(outcome.state_of(&key::<Deployment>("web")), Some(ResourceState::Unchanged));
    assert_eq!(store.counts().deletes, 1);
    assert!(store.object(&key::<BatchCronJob>("web-ping")).is_none());
    assert_eq!(outcome.capsule.status.unwrap().observed_generation, 2);
}

#[tokio::test]
async fn missing_env_secret_is_reported() {
    let (store, pipeline, capsule) = setup(spec());
    let outcome = pipeline.run(capsule).await.unwrap();

    let mut changed = outcome.capsule;
    changed.spec.env = Some(Env { disable_automatic: true, from: vec![EnvReference { kind: "Secret".into(), name: "db".into() }] });
    changed.metadata.generation = Some(2);
    let changed = store.insert_capsule(changed);

    store.reset_counts();
    let err = pipeline.run(changed).await.unwrap_err();
    assert!(matches!(err, PipelineError::Step { ref step, .. } if step == "deployment"));
    assert_eq!(store.counts().mutations(), 0);

    let status = store.capsule("prod", "web").and_then(|c| c.status).unwrap();
    assert_eq!(status.observed_generation, 1);
    assert_eq!(status.owned_resources.len(), 6);
    assert!(status.errors[0].contains("Secret 'db' not found"));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let (store, pipeline, capsule) = setup(spec());
    let outcome = pipeline.run_with(capsule, RunOptions { dry_run: true }).await.unwrap();
    assert_eq!(outcome.output_objects.len(), 6);
    assert!(outcome.output_objects.iter().all(|o| o.state == ResourceState::Created && o.object.is_some()));
    assert_eq!(store.counts().mutations(), 0);
    assert_eq!(store.counts().status_updates, 0);
    assert!(store.capsule("prod", "web").unwrap().status.is_none());
}
