//! The Capsule custom resource.
//!
//! The pipeline core treats [`CapsuleSpec`] as opaque: only steps read it. The
//! core reads `metadata` (namespace, name, uid, generation) and reads/writes
//! [`CapsuleStatus`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "capsule.dev",
    version = "v1alpha2",
    kind = "Capsule",
    namespaced,
    status = "CapsuleStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleSpec {
    /// Image the Capsule runs.
    pub image: String,
    /// Shell command; empty means the image ENTRYPOINT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CapsuleInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    #[serde(default)]
    pub scale: CapsuleScale,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Env>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<CronJob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Env {
    /// Skip the ConfigMap/Secret sharing the Capsule name.
    #[serde(default)]
    pub disable_automatic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<EnvReference>,
}

/// Reference to a ConfigMap or Secret in the Capsule namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvReference {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleScale {
    #[serde(default)]
    pub horizontal: HorizontalScale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical: Option<VerticalScale>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScale {
    #[serde(default)]
    pub instances: Instances,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_target: Option<CpuTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instances {
    pub min: u32,
    /// Omit to disable autoscaling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl Default for Instances {
    fn default() -> Self {
        Self { min: 1, max: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuTarget {
    /// Average CPU utilization in percent (1..=100).
    pub utilization: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalScale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleInterface {
    pub name: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<InterfaceProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<InterfaceProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<PublicInterface>,
}

/// Exactly one of `path`, `tcp` or `grpc` is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub tcp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcProbe>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcProbe {
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressInterface {
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInterface {
    pub port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<FileContentReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContentReference {
    /// `ConfigMap` or `Secret`.
    pub kind: String,
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub name: String,
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<JobUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<JobCommand>,
    /// Defaults to 6.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUrl {
    pub port: u16,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Published outcome of the latest reconciliation.
///
/// Every field is always serialized so a merge patch of `status` replaces the
/// previous value instead of leaving stale entries behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub owned_resources: Vec<OwnedResource>,
    #[serde(default)]
    pub used_resources: Vec<UsedResource>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedResource {
    pub r#ref: Option<TypedLocalObjectReference>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl OwnedResource {
    pub fn state(&self) -> Option<ResourceState> {
        ResourceState::parse(&self.state)
    }
}

/// A resource the Capsule depends on but does not own (env ConfigMaps etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedResource {
    pub r#ref: Option<TypedLocalObjectReference>,
    /// `found`, `missing` or `error`.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Transition classification of one child object in one commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Created,
    Updated,
    Unchanged,
    Deleted,
    AlreadyExists,
    ChangePending,
    Failed,
}

impl ResourceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::AlreadyExists => "alreadyExists",
            Self::ChangePending => "changePending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "unchanged" => Self::Unchanged,
            "deleted" => Self::Deleted,
            "alreadyExists" => Self::AlreadyExists,
            "changePending" => Self::ChangePending,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    /// Whether applying this transition issues a write against the store.
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Capsule {
    /// Generation remembered from the last fully successful commit.
    pub fn observed_generation(&self) -> i64 {
        self.status.as_ref().map(|s| s.observed_generation).unwrap_or(0)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_state_strings_round_trip() {
        for s in [
            ResourceState::Created,
            ResourceState::Updated,
            ResourceState::Unchanged,
            ResourceState::Deleted,
            ResourceState::AlreadyExists,
            ResourceState::ChangePending,
            ResourceState::Failed,
        ] {
            assert_eq!(ResourceState::parse(s.as_str()), Some(s));
        }
        assert_eq!(ResourceState::parse("bogus"), None);
        assert!(ResourceState::Deleted.is_mutation());
        assert!(!ResourceState::AlreadyExists.is_mutation());
    }

    #[test]
    fn capsule_yaml_uses_camel_case() {
        let y = r#"
apiVersion: capsule.dev/v1alpha2
kind: Capsule
metadata:
  name: web
  namespace: prod
  generation: 3
spec:
  image: nginx:1.25
  scale:
    horizontal:
      instances: { min: 2, max: 5 }
      cpuTarget: { utilization: 80 }
  cronJobs:
    - name: nightly
      schedule: "0 3 * * *"
      command: { command: ./cleanup }
status:
  observedGeneration: 2
  ownedResources:
    - ref: { apiGroup: apps, kind: Deployment, name: web }
      state: created
"#;
        let c: Capsule = serde_yaml::from_str(y).unwrap();
        assert_eq!(c.spec.scale.horizontal.instances.max, Some(5));
        assert_eq!(c.spec.cron_jobs[0].name, "nightly");
        assert_eq!(c.generation(), 3);
        assert_eq!(c.observed_generation(), 2);
        let owned = &c.status.as_ref().unwrap().owned_resources[0];
        assert_eq!(owned.state(), Some(ResourceState::Created));
    }
}
