//! Portage object store: a narrow, typed get/create/update/delete seam
//! over cluster objects, with distinguishable error kinds. Two
//! implementations: `KubeStore` against a live API server and
//! `MemoryStore`, an in-process cluster double for tests and dry runs.

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::Serialize;

mod cluster;
mod error;
mod memory;
pub mod snapshot;

pub use cluster::KubeStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use snapshot::VolumeSnapshot;

/// Bound for objects the store can hold: any namespaced, statically
/// typed Kubernetes resource.
pub trait StoreObject:
    kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
{
}

impl<T> StoreObject for T where
    T: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
{
}

/// Deletion propagation towards dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
    Background,
    Foreground,
}

pub(crate) fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).into_owned()
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    /// Create an object; the stored object (server defaults applied) is
    /// returned.
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace an existing object. Immutable-field rejections surface as
    /// `StoreError::Immutable`.
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    /// Delete an object; deleting an absent object is not an error.
    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<(), StoreError>;

    /// Delete every object of kind `K` matching a `key=value` label
    /// selector.
    async fn delete_labeled<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), StoreError>;

    /// Tail of logs from the pod(s) run by a job. Best-effort: an empty
    /// string when nothing is available.
    async fn job_logs(
        &self,
        namespace: &str,
        job_name: &str,
        tail_lines: i64,
    ) -> Result<String, StoreError>;
}
