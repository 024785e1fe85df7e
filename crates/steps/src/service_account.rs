use anyhow::Result;
use async_trait::async_trait;
use capsule_pipeline::{Request, RequestExt, Step};
use k8s_openapi::api::core::v1::ServiceAccount;

/// The identity the Capsule's pods run as.
pub struct ServiceAccountStep;

#[async_trait]
impl Step for ServiceAccountStep {
    fn name(&self) -> &str {
        "service-account"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        req.set_object(&ServiceAccount::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use capsule_core::{CapsuleSpec, OperatorConfig};
    use capsule_pipeline::gvk_for;

    #[tokio::test]
    async fn named_after_capsule() {
        let mut req = testing::request(testing::capsule(CapsuleSpec::default()), OperatorConfig::default());
        ServiceAccountStep.apply(&mut req).await.unwrap();
        let key = req.key(gvk_for::<ServiceAccount>());
        assert_eq!(key.to_string(), "v1/ServiceAccount/prod/web");
        assert!(req.get_new(&key).is_some());
    }
}
