//! Built-in Capsule steps, the plugin factory for configured steps, and the
//! assembly of the default pipeline.

#![forbid(unsafe_code)]

mod cron_jobs;
mod deployment;
mod horizontal_scale;
mod network;
pub mod plugin;
mod service_account;
mod service_monitor;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use capsule_core::{Capsule, OperatorConfig, Scheme, LABEL_CAPSULE};
use capsule_kubehub::ObjectStore;
use capsule_pipeline::{Pipeline, Step};
use kube::ResourceExt;
use tracing::info;

pub use cron_jobs::CronJobsStep;
pub use deployment::DeploymentStep;
pub use horizontal_scale::{hpa_enabled, HorizontalScaleStep};
pub use network::NetworkStep;
pub use plugin::{build_step, AnnotationsStep, NamespaceFilter};
pub use service_account::ServiceAccountStep;
pub use service_monitor::ServiceMonitorStep;

/// Built-in steps in execution order. The network and cron-job steps read
/// the deployment written before them.
pub fn builtin_steps(config: &OperatorConfig) -> Vec<Arc<dyn Step>> {
    let mut steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(DeploymentStep),
        Arc::new(ServiceAccountStep),
        Arc::new(NetworkStep),
        Arc::new(HorizontalScaleStep),
        Arc::new(CronJobsStep),
    ];
    if let Some(sm) = config.prometheus_service_monitor.as_ref().filter(|sm| !sm.port_name.is_empty()) {
        steps.push(Arc::new(ServiceMonitorStep::new(sm.clone())));
    }
    steps
}

/// Built-in steps followed by the configured ones, in file order. Fails on
/// the first step configuration that does not resolve to a plugin.
pub fn default_pipeline(store: Arc<dyn ObjectStore>, scheme: Arc<Scheme>, config: Arc<OperatorConfig>) -> Result<Pipeline> {
    let mut pipeline = Pipeline::new(store, scheme, config.clone());
    for step in builtin_steps(&config) {
        pipeline.add_step(step);
    }
    for (i, sc) in config.pipeline.steps.iter().enumerate() {
        let step = build_step(sc).with_context(|| format!("pipeline step #{i} ({})", sc.plugin))?;
        pipeline.add_step(step);
    }
    info!(steps = ?pipeline.step_names(), "pipeline assembled");
    Ok(pipeline)
}

/// Selector labels shared by the Capsule's pods and the objects fronting them.
pub(crate) fn selector_labels(capsule: &Capsule) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CAPSULE.to_string(), capsule.name_any())])
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use capsule_core::{Capsule, CapsuleSpec, OperatorConfig, Scheme};
    use capsule_kubehub::{MemoryStore, ObjectStore};
    use capsule_pipeline::CapsuleRequest;

    pub fn capsule(spec: CapsuleSpec) -> Capsule {
        let mut c = Capsule::new("web", spec);
        c.metadata.namespace = Some("prod".into());
        c.metadata.uid = Some("uid-web".into());
        c.metadata.generation = Some(1);
        c
    }

    pub fn request(capsule: Capsule, config: OperatorConfig) -> CapsuleRequest {
        request_with_store(capsule, config, Arc::new(MemoryStore::new()))
    }

    pub fn request_with_store(capsule: Capsule, config: OperatorConfig, store: Arc<dyn ObjectStore>) -> CapsuleRequest {
        CapsuleRequest::new(capsule, Arc::new(config), Arc::new(Scheme::builtin()), store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::config::{ServiceMonitorConfig, StepConfig};
    use capsule_kubehub::MemoryStore;

    #[test]
    fn service_monitor_step_requires_a_port() {
        let mut config = OperatorConfig::default();
        assert_eq!(builtin_steps(&config).len(), 5);
        config.prometheus_service_monitor = Some(ServiceMonitorConfig::default());
        assert_eq!(builtin_steps(&config).len(), 5);
        config.prometheus_service_monitor =
            Some(ServiceMonitorConfig { port_name: "metrics".into(), ..Default::default() });
        assert_eq!(builtin_steps(&config).last().map(|s| s.name().to_string()).as_deref(), Some("service-monitor"));
    }

    #[test]
    fn default_pipeline_order() {
        let mut config = OperatorConfig::default();
        config.pipeline.steps.push(StepConfig {
            plugin: "capsule.annotations".into(),
            config: "labels: {team: web}".into(),
            ..Default::default()
        });
        let p = default_pipeline(Arc::new(MemoryStore::new()), Arc::new(Scheme::builtin()), Arc::new(config)).unwrap();
        assert_eq!(
            p.step_names(),
            vec!["deployment", "service-account", "network", "horizontal-scale", "cron-jobs", "capsule.annotations"]
        );
    }

    #[test]
    fn unknown_plugin_fails_assembly() {
        let mut config = OperatorConfig::default();
        config.pipeline.steps.push(StepConfig { plugin: "example.nope".into(), ..Default::default() });
        let err = default_pipeline(Arc::new(MemoryStore::new()), Arc::new(Scheme::builtin()), Arc::new(config))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("unknown step plugin 'example.nope'"));
    }
}
