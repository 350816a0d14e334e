//! Live-cluster store backed by kube-rs typed APIs.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::{kind_of, DeletePropagation, ObjectStore, StoreError, StoreObject};

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a store from the ambient kubeconfig/in-cluster config.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_err<K: StoreObject>(namespace: &str, name: &str, err: kube::Error) -> StoreError {
        let kind = kind_of::<K>();
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists {
                    kind,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            kube::Error::Api(ae) if ae.code == 422 => StoreError::Immutable {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: ae.message,
            },
            other => StoreError::Api(other.to_string()),
        }
    }
}

fn delete_params(propagation: DeletePropagation) -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(match propagation {
            DeletePropagation::Background => PropagationPolicy::Background,
            DeletePropagation::Foreground => PropagationPolicy::Foreground,
        }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Self::map_err::<K>(namespace, name, e))
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "creating object");
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err::<K>(&namespace, &name, e))
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err::<K>(&namespace, &name, e))
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<(), StoreError> {
        match self
            .api::<K>(namespace)
            .delete(name, &delete_params(propagation))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped = Self::map_err::<K>(namespace, name, e);
                if mapped.is_not_found() {
                    Ok(())
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn delete_labeled<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), StoreError> {
        let lp = ListParams::default().labels(selector);
        self.api::<K>(namespace)
            .delete_collection(&delete_params(DeletePropagation::Background), &lp)
            .await
            .map_err(|e| Self::map_err::<K>(namespace, selector, e))?;
        Ok(())
    }

    async fn job_logs(
        &self,
        namespace: &str,
        job_name: &str,
        tail_lines: i64,
    ) -> Result<String, StoreError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("job-name={}", job_name));
        let list = pods
            .list(&lp)
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        let Some(pod) = list.items.first().and_then(|p| p.metadata.name.clone()) else {
            return Ok(String::new());
        };
        let mut params = LogParams::default();
        params.tail_lines = Some(tail_lines);
        pods.logs(&pod, &params)
            .await
            .map_err(|e| StoreError::Api(e.to_string()))
    }
}
