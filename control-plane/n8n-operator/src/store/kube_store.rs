use async_trait::async_trait;
use kube::{
    Client, ResourceExt,
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
};
use serde_json::json;
use tracing::trace;

use super::{ObjectKey, Store, StoreError, StoreObject};

/// [`Store`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn map_err<K: StoreObject>(e: kube::Error, namespace: &str, name: &str) -> StoreError {
    let key = ObjectKey::of::<K>(namespace, name);
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key)
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(key),
        _ => StoreError::Kube(e),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        trace!(kind = %K::kind(&()), %namespace, %name, "store: get");
        match self.api::<K>(namespace).get_opt(name).await {
            Ok(obj) => Ok(obj),
            // A kind whose CRD is not installed answers 404 as well
            Err(e) => match map_err::<K>(e, namespace, name) {
                StoreError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %namespace, %name, "store: create");
        self.api::<K>(namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| map_err::<K>(e, namespace, &name))
    }

    async fn update<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %namespace, %name, "store: update");
        self.api::<K>(namespace)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| map_err::<K>(e, namespace, &name))
    }

    async fn update_status<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), %namespace, %name, "store: update_status");
        let body = serde_json::to_value(obj)?;
        // resourceVersion in the patch makes the server reject stale writes
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": body.get("status").cloned().unwrap_or_default(),
        });
        let pp = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api::<K>(namespace)
            .patch_status(&name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err::<K>(e, namespace, &name))
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        trace!(kind = %K::kind(&()), %namespace, %name, "store: delete");
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err::<K>(e, namespace, name))
    }
}
