//! The Deployment running the Capsule's container.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use capsule_core::capsule::ResourceLimits;
use capsule_core::{Capsule, UsedResource, LABEL_CAPSULE};
use capsule_kubehub::get_opt;
use capsule_pipeline::{gvk_for, Request, RequestExt, Step};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, ConfigMapVolumeSource, Container, EnvFromSource, EnvVar, KeyToPath, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretEnvSource, SecretVolumeSource, TypedLocalObjectReference, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use tracing::debug;

use crate::horizontal_scale::hpa_enabled;
use crate::selector_labels;

pub(crate) const DEFAULT_CPU_REQUEST: &str = "200m";
pub(crate) const DEFAULT_MEMORY_REQUEST: &str = "256Mi";

/// Env var carrying the Capsule name into the container.
pub const ENV_CAPSULE_NAME: &str = "CAPSULE_NAME";

pub struct DeploymentStep;

#[async_trait]
impl Step for DeploymentStep {
    fn name(&self) -> &str {
        "deployment"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        let capsule = req.capsule().clone();
        let env_from = used_resources(req, &capsule).await?;
        let key = req.key(gvk_for::<Deployment>());
        let current: Option<Deployment> = req.current_as(&key)?;
        let deployment = build(&capsule, current.as_ref(), env_from);
        req.set_object(&deployment)?;
        Ok(())
    }
}

/// Look up every ConfigMap/Secret the Capsule reads and record it as used.
/// Returns the env sources in container order: explicit references first,
/// then the automatic ones sharing the Capsule name when they exist.
async fn used_resources(req: &mut dyn Request, capsule: &Capsule) -> Result<Vec<EnvFromSource>> {
    let name = capsule.name_any();
    let env = capsule.spec.env.clone().unwrap_or_default();
    let mut marked: Vec<(String, String)> = Vec::new();
    let mut sources = Vec::new();

    for r in &env.from {
        lookup(req, &mut marked, &r.kind, &r.name, true).await?;
        sources.push(env_from(&r.kind, &r.name)?);
    }
    if !env.disable_automatic {
        for kind in ["ConfigMap", "Secret"] {
            if lookup(req, &mut marked, kind, &name, false).await? {
                sources.push(env_from(kind, &name)?);
            }
        }
    }
    for f in &capsule.spec.files {
        if let Some(r) = &f.r#ref {
            lookup(req, &mut marked, &r.kind, &r.name, true).await?;
        }
    }
    Ok(sources)
}

/// `Ok(true)` when the resource exists. A missing `required` resource is
/// marked `error` and fails the step.
async fn lookup(
    req: &mut dyn Request,
    marked: &mut Vec<(String, String)>,
    kind: &str,
    name: &str,
    required: bool,
) -> Result<bool> {
    let gvk = match kind {
        "ConfigMap" | "Secret" => GroupVersionKind::gvk("", "v1", kind),
        other => bail!("unsupported reference kind '{other}' for '{name}'"),
    };
    let key = req.named_key(name, gvk);
    let store = req.store();
    let found = get_opt(store.as_ref(), &key).await;
    let (state, message, result) = match found {
        Ok(Some(_)) => ("found", None, Ok(true)),
        Ok(None) if !required => ("missing", None, Ok(false)),
        Ok(None) => {
            let msg = format!("{kind} '{name}' not found");
            ("error", Some(msg.clone()), Err(anyhow!(msg)))
        }
        Err(e) => {
            let msg = e.to_string();
            ("error", Some(msg.clone()), Err(anyhow!("could not get {kind} '{name}': {msg}")))
        }
    };
    let id = (kind.to_string(), name.to_string());
    if !marked.contains(&id) {
        debug!(kind, name, state, "used resource");
        req.mark_used_resource(UsedResource {
            r#ref: Some(TypedLocalObjectReference { api_group: None, kind: kind.into(), name: name.into() }),
            state: state.into(),
            message,
        });
        marked.push(id);
    }
    result
}

fn env_from(kind: &str, name: &str) -> Result<EnvFromSource> {
    match kind {
        "ConfigMap" => Ok(EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource { name: Some(name.into()), ..Default::default() }),
            ..Default::default()
        }),
        "Secret" => Ok(EnvFromSource {
            secret_ref: Some(SecretEnvSource { name: Some(name.into()), ..Default::default() }),
            ..Default::default()
        }),
        other => bail!("unsupported env source kind '{other}'"),
    }
}

pub(crate) fn build(capsule: &Capsule, current: Option<&Deployment>, env_from: Vec<EnvFromSource>) -> Deployment {
    let name = capsule.name_any();
    let spec = &capsule.spec;

    let current_spec = current.and_then(|d| d.spec.as_ref());
    let replicas = match current_spec.and_then(|s| s.replicas) {
        Some(r) if hpa_enabled(capsule) => r,
        _ => i32::try_from(spec.scale.horizontal.instances.min).unwrap_or(i32::MAX),
    };
    let selector = match current_spec.map(|s| &s.selector) {
        Some(s) if s.match_expressions.as_ref().map_or(true, Vec::is_empty)
            && s.match_labels.as_ref().is_some_and(|l| !l.is_empty()) =>
        {
            s.clone()
        }
        _ => LabelSelector { match_labels: Some(selector_labels(capsule)), ..Default::default() },
    };
    let mut pod_labels = selector.match_labels.clone().unwrap_or_default();
    pod_labels.insert(LABEL_CAPSULE.to_string(), name.clone());

    let (volumes, mounts) = file_volumes(capsule);
    let container = Container {
        name: name.clone(),
        image: Some(spec.image.clone()),
        command: spec.command.as_ref().filter(|c| !c.is_empty()).map(|c| vec![c.clone()]),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: Some(vec![EnvVar { name: ENV_CAPSULE_NAME.into(), value: Some(name.clone()), ..Default::default() }]),
        env_from: (!env_from.is_empty()).then_some(env_from),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        resources: Some(resources(capsule)),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta { name: Some(name.clone()), ..Default::default() },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(pod_labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    service_account_name: Some(name),
                    node_selector: (!spec.node_selector.is_empty()).then(|| spec.node_selector.clone()),
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources(capsule: &Capsule) -> ResourceRequirements {
    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(DEFAULT_CPU_REQUEST.into())),
        ("memory".to_string(), Quantity(DEFAULT_MEMORY_REQUEST.into())),
    ]);
    let mut limits = BTreeMap::new();
    if let Some(v) = &capsule.spec.scale.vertical {
        for (resource, l) in [("cpu", &v.cpu), ("memory", &v.memory)] {
            let Some(ResourceLimits { request, limit }) = l else {
                continue;
            };
            if let Some(q) = non_zero(request) {
                requests.insert(resource.to_string(), q);
            }
            if let Some(q) = non_zero(limit) {
                limits.insert(resource.to_string(), q);
            }
        }
    }
    ResourceRequirements {
        requests: Some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }
}

fn non_zero(q: &Option<Quantity>) -> Option<Quantity> {
    q.as_ref().filter(|q| !is_zero(q)).cloned()
}

/// Only the numeric prefix matters: `0`, `0m` and `0.0Gi` are all zero.
fn is_zero(q: &Quantity) -> bool {
    let number: String = q.0.chars().take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-')).collect();
    number.parse::<f64>().map_or(number.is_empty(), |v| v == 0.0)
}

/// One volume per referenced ConfigMap/Secret file, mounted at the file
/// path with the key projected onto the file's basename.
fn file_volumes(capsule: &Capsule) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for f in &capsule.spec.files {
        let Some(r) = &f.r#ref else {
            continue;
        };
        let base = Path::new(&f.path)
            .file_name()
            .map(|b| b.to_string_lossy().into_owned())
            .unwrap_or_else(|| f.path.clone());
        let items = Some(vec![KeyToPath { key: r.key.clone(), path: base.clone(), ..Default::default() }]);
        let volume = match r.kind.as_str() {
            "ConfigMap" => Volume {
                name: format!("configmap-{}", r.name),
                config_map: Some(ConfigMapVolumeSource { name: Some(r.name.clone()), items, ..Default::default() }),
                ..Default::default()
            },
            "Secret" => Volume {
                name: format!("secret-{}", r.name),
                secret: Some(SecretVolumeSource { secret_name: Some(r.name.clone()), items, ..Default::default() }),
                ..Default::default()
            },
            _ => continue,
        };
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: f.path.clone(),
            sub_path: Some(base),
            ..Default::default()
        });
        volumes.push(volume);
    }
    (volumes, mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use capsule_core::capsule::{
        CpuTarget, Env, EnvReference, File, FileContentReference, HorizontalScale, Instances, VerticalScale,
    };
    use capsule_core::{CapsuleSpec, OperatorConfig};
    use capsule_kubehub::MemoryStore;
    use capsule_pipeline::to_dynamic;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::Arc;

    fn spec() -> CapsuleSpec {
        CapsuleSpec { image: "nginx:1.25".into(), args: vec!["-g".into()], ..Default::default() }
    }

    #[test]
    fn builds_container_from_spec() {
        let c = testing::capsule(spec());
        let d = build(&c, None, Vec::new());
        let s = d.spec.unwrap();
        assert_eq!(s.replicas, Some(1));
        assert_eq!(s.selector.match_labels.unwrap()[LABEL_CAPSULE], "web");
        let pod = s.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("web"));
        let container = &pod.containers[0];
        assert_eq!(container.name, "web");
        assert_eq!(container.image.as_deref(), Some("nginx:1.25"));
        assert!(container.command.is_none());
        let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("200m".into()));
    }

    #[test]
    fn vertical_scale_overrides_defaults() {
        let mut s = spec();
        s.scale.vertical = Some(VerticalScale {
            cpu: Some(ResourceLimits { request: Some(Quantity("500m".into())), limit: Some(Quantity("1".into())) }),
            memory: Some(ResourceLimits { request: Some(Quantity("0".into())), limit: None }),
        });
        let d = build(&testing::capsule(s), None, Vec::new());
        let res = d.spec.unwrap().template.spec.unwrap().containers[0].resources.clone().unwrap();
        let requests = res.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("500m".into()));
        assert_eq!(requests["memory"], Quantity("256Mi".into()));
        assert_eq!(res.limits.unwrap()["cpu"], Quantity("1".into()));
    }

    #[test]
    fn zero_quantities() {
        assert!(is_zero(&Quantity("0".into())));
        assert!(is_zero(&Quantity("0m".into())));
        assert!(is_zero(&Quantity(String::new())));
        assert!(!is_zero(&Quantity("0.5".into())));
        assert!(!is_zero(&Quantity("128Mi".into())));
    }

    #[test]
    fn autoscaled_replicas_are_kept() {
        let mut s = spec();
        s.scale.horizontal = HorizontalScale {
            instances: Instances { min: 2, max: Some(5) },
            cpu_target: Some(CpuTarget { utilization: 80 }),
        };
        let c = testing::capsule(s);
        let mut current = build(&c, None, Vec::new());
        current.spec.as_mut().unwrap().replicas = Some(4);
        assert_eq!(build(&c, Some(&current), Vec::new()).spec.unwrap().replicas, Some(4));

        let mut fixed = c.clone();
        fixed.spec.scale.horizontal.cpu_target = None;
        assert_eq!(build(&fixed, Some(&current), Vec::new()).spec.unwrap().replicas, Some(2));
    }

    #[test]
    fn existing_selector_is_kept() {
        let c = testing::capsule(spec());
        let mut current = build(&c, None, Vec::new());
        current.spec.as_mut().unwrap().selector.match_labels =
            Some(BTreeMap::from([("app".to_string(), "legacy".to_string())]));
        let d = build(&c, Some(&current), Vec::new());
        let s = d.spec.unwrap();
        assert_eq!(s.selector.match_labels.unwrap()["app"], "legacy");
        let labels = s.template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels["app"], "legacy");
        assert_eq!(labels[LABEL_CAPSULE], "web");
    }

    #[test]
    fn files_become_volumes() {
        let mut s = spec();
        s.files = vec![File {
            path: "/etc/app/config.yaml".into(),
            r#ref: Some(FileContentReference { kind: "ConfigMap".into(), name: "app".into(), key: "cfg".into() }),
        }];
        let pod = build(&testing::capsule(s), None, Vec::new()).spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.name, "configmap-app");
        assert_eq!(volume.config_map.as_ref().unwrap().items.as_ref().unwrap()[0].path, "config.yaml");
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/etc/app/config.yaml");
        assert_eq!(mount.sub_path.as_deref(), Some("config.yaml"));
    }

    #[tokio::test]
    async fn marks_used_resources() {
        let store = Arc::new(MemoryStore::new());
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("web".into());
        cm.metadata.namespace = Some("prod".into());
        let mut cm = to_dynamic(&cm).unwrap();
        cm.types = Some(kube::core::TypeMeta { api_version: "v1".into(), kind: "ConfigMap".into() });
        store.insert(cm).unwrap();

        let c = testing::capsule(spec());
        let mut req = testing::request_with_store(c, OperatorConfig::default(), store);
        DeploymentStep.apply(&mut req).await.unwrap();

        let used = req.used_resources();
        assert_eq!(used.len(), 2);
        assert_eq!(used[0].r#ref.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(used[0].state, "found");
        assert_eq!(used[1].state, "missing");

        let key = req.key(gvk_for::<Deployment>());
        let d: Deployment = req.new_as(&key).unwrap().unwrap();
        let env_from = d.spec.unwrap().template.spec.unwrap().containers[0].env_from.clone().unwrap();
        assert_eq!(env_from.len(), 1);
        assert_eq!(env_from[0].config_map_ref.as_ref().unwrap().name.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn missing_explicit_reference_fails() {
        let mut s = spec();
        s.env = Some(Env {
            disable_automatic: true,
            from: vec![EnvReference { kind: "Secret".into(), name: "db".into() }],
        });
        let mut req = testing::request(testing::capsule(s), OperatorConfig::default());
        let err = DeploymentStep.apply(&mut req).await.unwrap_err();
        assert!(err.to_string().contains("Secret 'db' not found"));
        assert_eq!(req.used_resources()[0].state, "error");
    }
}
