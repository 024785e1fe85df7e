//! Operator configuration (YAML, camelCase), with a few environment overrides
//! in the style of the rest of the toolchain (`CAPSULE_*`).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Concurrent reconcile runs in the watch loop.
    pub workers: usize,
    pub pipeline: PipelineConfig,
    pub service: ServiceConfig,
    pub ingress: IngressConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_service_monitor: Option<ServiceMonitorConfig>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pipeline: PipelineConfig::default(),
            service: ServiceConfig::default(),
            ingress: IngressConfig::default(),
            prometheus_service_monitor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Absolute cap on commit attempts per run, on top of the key-count bound.
    pub max_attempts: usize,
    /// Custom steps, appended after the built-in ones in this order.
    pub steps: Vec<StepConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_attempts: 16, steps: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepConfig {
    pub plugin: String,
    /// When non-empty, only Capsules in these namespaces run the step.
    pub namespaces: Vec<String>,
    /// Opaque YAML/JSON handed to the plugin.
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub r#type: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { r#type: "ClusterIP".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMonitorConfig {
    /// Defaults to `/metrics`.
    pub path: String,
    pub port_name: String,
}

impl OperatorConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing operator config")
    }

    /// Load from `path`, falling back to `CAPSULE_CONFIG`, then to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var("CAPSULE_CONFIG").ok();
        let path = path.map(Path::to_path_buf).or_else(|| from_env.map(Into::into));
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("reading operator config at {}", p.display()))?;
                debug!(path = %p.display(), "operator config loaded");
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(n) = env_usize("CAPSULE_WORKERS") {
            self.workers = n;
        }
        if let Some(n) = env_usize("CAPSULE_MAX_ATTEMPTS") {
            self.pipeline.max_attempts = n;
        }
        self.workers = self.workers.max(1);
        self.pipeline.max_attempts = self.pipeline.max_attempts.max(1);
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let cfg = OperatorConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg, OperatorConfig::default());
        assert_eq!(cfg.service.r#type, "ClusterIP");
        assert_eq!(cfg.pipeline.max_attempts, 16);
    }

    #[test]
    fn parses_custom_steps() {
        let cfg = OperatorConfig::from_yaml(
            r#"
workers: 8
ingress:
  className: nginx
pipeline:
  maxAttempts: 4
  steps:
    - plugin: capsule.annotations
      namespaces: [prod]
      config: |
        kind: Deployment
        group: apps
        labels:
          team: web
prometheusServiceMonitor:
  portName: metrics
"#,
        )
        .unwrap();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.pipeline.max_attempts, 4);
        assert_eq!(cfg.ingress.class_name.as_deref(), Some("nginx"));
        assert_eq!(cfg.pipeline.steps[0].plugin, "capsule.annotations");
        assert_eq!(cfg.pipeline.steps[0].namespaces, vec!["prod".to_string()]);
        assert!(cfg.pipeline.steps[0].config.contains("team: web"));
        assert_eq!(cfg.prometheus_service_monitor.unwrap().port_name, "metrics");
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let err = OperatorConfig::from_yaml("workers: [1").unwrap_err();
        assert!(format!("{err:#}").contains("parsing operator config"));
    }
}
