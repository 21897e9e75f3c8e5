use kube::Resource;
use tracing::info;

use crate::store::{Store, StoreError, StoreObject};

pub const FINALIZER: &str = "cache.slys.dev/finalizer";

pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Add the finalizer if missing. On change `obj` is replaced with the
/// stored copy so later writes carry a fresh resourceVersion.
pub async fn ensure<S: Store, K: StoreObject>(
    store: &S,
    namespace: &str,
    obj: &mut K,
) -> Result<bool, StoreError> {
    if has_finalizer(obj) {
        return Ok(false);
    }
    let mut next = obj.clone();
    next.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    *obj = store.update(namespace, &next).await?;
    info!(%namespace, name = ?obj.meta().name, "finalizer: added");
    Ok(true)
}

/// Remove the finalizer if present. Once the record is deleting and no
/// finalizers remain the store is free to drop it.
pub async fn release<S: Store, K: StoreObject>(
    store: &S,
    namespace: &str,
    obj: &mut K,
) -> Result<bool, StoreError> {
    if !has_finalizer(obj) {
        return Ok(false);
    }
    let mut next = obj.clone();
    if let Some(finals) = next.meta_mut().finalizers.as_mut() {
        finals.retain(|f| f != FINALIZER);
    }
    *obj = store.update(namespace, &next).await?;
    info!(%namespace, name = ?obj.meta().name, "finalizer: removed");
    Ok(true)
}
