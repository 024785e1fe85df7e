//! [`ObjectStore`] over a live cluster via kube-rs dynamic APIs.

use anyhow::Result;
use capsule_core::{gvk_key, Capsule, ObjectKey};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{ObjectStore, StoreError};

const FIELD_MANAGER: &str = "capsule-operator";

pub struct KubeStore {
    client: Client,
    // Discovery is expensive; child types are few and stable.
    resources: RwLock<FxHashMap<GroupVersionKind, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
        if let Some(found) = self.resources.read().await.get(gvk) {
            return Ok(found.clone());
        }
        let found = find_api_resource(self.client.clone(), gvk).await?;
        debug!(gvk = %gvk_key(gvk), plural = %found.0.plural, "resolved api resource");
        self.resources.write().await.insert(gvk.clone(), found.clone());
        Ok(found)
    }

    async fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resource(&key.gvk).await?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &key.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .map_err(|e| StoreError::Discovery(e.to_string()))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(StoreError::Discovery(format!("GVK not served: {}", gvk_key(gvk))))
}

fn post_params(dry_run: bool) -> PostParams {
    PostParams { dry_run, field_manager: Some(FIELD_MANAGER.to_string()) }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError> {
        counter!("store_requests_total", 1u64, "verb" => "get");
        let api = self.api(key).await?;
        Ok(api.get(&key.name).await?)
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError> {
        counter!("store_requests_total", 1u64, "verb" => "create");
        let api = self.api(key).await?;
        Ok(api.create(&post_params(dry_run), obj).await?)
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError> {
        counter!("store_requests_total", 1u64, "verb" => "update");
        let api = self.api(key).await?;
        Ok(api.replace(&key.name, &post_params(dry_run), obj).await?)
    }

    async fn delete(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<(), StoreError> {
        counter!("store_requests_total", 1u64, "verb" => "delete");
        let api = self.api(key).await?;
        let dp = DeleteParams {
            preconditions: Some(Preconditions { uid: obj.uid(), resource_version: None }),
            ..DeleteParams::default()
        };
        api.delete(&key.name, &dp).await?;
        Ok(())
    }

    async fn update_capsule_status(&self, capsule: &Capsule) -> Result<Capsule, StoreError> {
        counter!("store_requests_total", 1u64, "verb" => "status");
        let ns = capsule.namespace().unwrap_or_default();
        let api: Api<Capsule> = Api::namespaced(self.client.clone(), &ns);
        let patch = serde_json::json!({ "status": capsule.status });
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..PatchParams::default() };
        Ok(api.patch_status(&capsule.name_any(), &pp, &Patch::Merge(&patch)).await?)
    }
}
