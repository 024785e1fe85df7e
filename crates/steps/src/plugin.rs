//! Configured steps: plugin name to implementation, plus the namespace
//! filter applied to steps restricted to some namespaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use capsule_core::config::StepConfig;
use capsule_pipeline::{Request, Step};
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

/// Resolve a configured step. Unknown plugins and bad plugin
/// configuration are errors.
pub fn build_step(sc: &StepConfig) -> Result<Arc<dyn Step>> {
    let step: Arc<dyn Step> = match sc.plugin.as_str() {
        AnnotationsStep::PLUGIN => Arc::new(AnnotationsStep::from_config(&sc.config)?),
        other => bail!("unknown step plugin '{other}'"),
    };
    if sc.namespaces.is_empty() {
        return Ok(step);
    }
    Ok(Arc::new(NamespaceFilter::new(step, sc.namespaces.clone())))
}

/// Runs `inner` only for Capsules in one of `namespaces`.
pub struct NamespaceFilter {
    inner: Arc<dyn Step>,
    namespaces: Vec<String>,
}

impl NamespaceFilter {
    pub fn new(inner: Arc<dyn Step>, namespaces: Vec<String>) -> Self {
        Self { inner, namespaces }
    }

    fn matches(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|n| n == namespace)
    }
}

#[async_trait]
impl Step for NamespaceFilter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        let ns = req.capsule().namespace().unwrap_or_default();
        if !self.matches(&ns) {
            debug!(step = self.name(), namespace = %ns, "step skipped for namespace");
            return Ok(());
        }
        self.inner.apply(req).await
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnnotationsConfig {
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub group: String,
    pub kind: String,
    /// Defaults to the Capsule name.
    pub name: String,
}

impl Default for AnnotationsConfig {
    fn default() -> Self {
        Self {
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            group: "apps".into(),
            kind: "Deployment".into(),
            name: String::new(),
        }
    }
}

/// Merges labels and annotations into one desired object. An empty value
/// removes the key.
pub struct AnnotationsStep {
    config: AnnotationsConfig,
}

impl AnnotationsStep {
    pub const PLUGIN: &'static str = "capsule.annotations";

    pub fn new(config: AnnotationsConfig) -> Self {
        Self { config }
    }

    pub fn from_config(raw: &str) -> Result<Self> {
        let config: AnnotationsConfig = if raw.trim().is_empty() {
            AnnotationsConfig::default()
        } else {
            serde_yaml::from_str(raw).context("parsing capsule.annotations config")?
        };
        Ok(Self::new(config))
    }
}

#[async_trait]
impl Step for AnnotationsStep {
    fn name(&self) -> &str {
        Self::PLUGIN
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        let gvk = req.scheme().types.lookup(&self.config.group, &self.config.kind)?;
        let key = if self.config.name.is_empty() {
            req.key(gvk)
        } else {
            req.named_key(&self.config.name, gvk)
        };
        let Some(mut obj) = req.get_new(&key) else {
            debug!(object = %key, "nothing to annotate");
            return Ok(());
        };
        merge(obj.annotations_mut(), &self.config.annotations);
        merge(obj.labels_mut(), &self.config.labels);
        req.set(key, obj);
        Ok(())
    }
}

fn merge(target: &mut BTreeMap<String, String>, values: &BTreeMap<String, String>) {
    for (k, v) in values {
        if v.is_empty() {
            target.remove(k);
        } else {
            target.insert(k.clone(), v.clone());
        }
    }
}
