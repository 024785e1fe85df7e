use anyhow::Result;
use async_trait::async_trait;
use capsule_core::Capsule;
use capsule_pipeline::{Request, RequestExt, Step};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

/// Autoscaling needs room to scale and a CPU target to scale on.
pub fn hpa_enabled(capsule: &Capsule) -> bool {
    let h = &capsule.spec.scale.horizontal;
    h.cpu_target.is_some() && h.instances.max.is_some_and(|max| max > h.instances.min)
}

pub struct HorizontalScaleStep;

#[async_trait]
impl Step for HorizontalScaleStep {
    fn name(&self) -> &str {
        "horizontal-scale"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        if let Some(hpa) = build(req.capsule()) {
            req.set_object(&hpa)?;
        }
        Ok(())
    }
}

fn build(capsule: &Capsule) -> Option<HorizontalPodAutoscaler> {
    if !hpa_enabled(capsule) {
        return None;
    }
    let h = &capsule.spec.scale.horizontal;
    let target = h.cpu_target.as_ref()?;
    let name = capsule.name_any();
    Some(HorizontalPodAutoscaler {
        metadata: ObjectMeta { name: Some(name.clone()), ..Default::default() },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name,
            },
            min_replicas: Some(to_i32(h.instances.min)),
            max_replicas: to_i32(h.instances.max.unwrap_or(h.instances.min)),
            metrics: Some(vec![MetricSpec {
                type_: "Resource".into(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".into(),
                    target: MetricTarget {
                        type_: "Utilization".into(),
                        average_utilization: Some(to_i32(target.utilization)),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
