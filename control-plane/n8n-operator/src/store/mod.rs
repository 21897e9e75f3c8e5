//! Object store capability used by the reconciler.
//!
//! The reconciler never talks to the API server directly; it receives a
//! [`Store`] so the same control flow runs against the cluster
//! ([`KubeStore`]) or against [`MemoryStore`] in tests.

pub mod kube_store;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use serde::{Serialize, de::DeserializeOwned};

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, Verb, Write};

/// Anything the reconciler can read or write through a [`Store`].
pub trait StoreObject:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Identifies one object for error reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: StoreObject>(namespace: &str, name: &str) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(ObjectKey),
    #[error("api error: {0}")]
    Kube(#[source] kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether retrying the whole invocation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::Kube(_) | StoreError::Injected(_)
        )
    }
}

/// Optimistically-concurrent object store keyed by (kind, namespace, name).
///
/// `update` and `update_status` fail with [`StoreError::Conflict`] when the
/// object's resourceVersion is stale. Absence on `get` is `Ok(None)`, not an
/// error.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    async fn create<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError>;

    /// Replace the main body (metadata and spec); status is left untouched.
    async fn update<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError>;

    /// Write only the status subresource.
    async fn update_status<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError>;

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError>;
}
