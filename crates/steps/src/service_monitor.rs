use anyhow::{Context, Result};
use async_trait::async_trait;
use capsule_core::config::ServiceMonitorConfig;
use capsule_core::scheme::{gvk, SERVICE_MONITOR};
use capsule_core::Capsule;
use capsule_pipeline::{Request, Step};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::json;

use crate::selector_labels;

const DEFAULT_PATH: &str = "/metrics";

/// Prometheus operator `ServiceMonitor` scraping the Capsule's service.
pub struct ServiceMonitorStep {
    config: ServiceMonitorConfig,
}

impl ServiceMonitorStep {
    pub fn new(config: ServiceMonitorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Step for ServiceMonitorStep {
    fn name(&self) -> &str {
        "service-monitor"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        if self.config.port_name.is_empty() {
            return Ok(());
        }
        let obj = build(req.capsule(), &self.config).context("encoding service monitor")?;
        let key = req.key(gvk(SERVICE_MONITOR));
        req.set(key, obj);
        Ok(())
    }
}

fn build(capsule: &Capsule, config: &ServiceMonitorConfig) -> serde_json::Result<DynamicObject> {
    let labels = selector_labels(capsule);
    let path = if config.path.is_empty() { DEFAULT_PATH } else { config.path.as_str() };
    serde_json::from_value(json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": {
            "name": capsule.name_any(),
            "labels": labels,
        },
        "spec": {
            "selector": { "matchLabels": labels },
            "endpoints": [{ "port": config.port_name, "path": path }],
        },
    }))
}
