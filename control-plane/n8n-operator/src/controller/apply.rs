//! Create-or-leave-alone helpers for child resources.
//!
//! Neither helper retries; a failed call is returned as-is and the next
//! invocation picks up where this one stopped.

use tracing::{debug, info};

use super::ReconcileErr;
use crate::store::{Store, StoreObject};
use crate::templates::SynthesisError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Unchanged,
    Deleted,
    Absent,
}

fn synthesis_err<K: StoreObject>(source: SynthesisError) -> ReconcileErr {
    ReconcileErr::Synthesis {
        kind: K::kind(&()).to_string(),
        source,
    }
}

/// Create `name` from `synthesize()` when it does not exist yet. An existing
/// object is never modified.
pub async fn ensure_exists<S, K, F>(
    store: &S,
    namespace: &str,
    name: &str,
    synthesize: F,
) -> Result<Applied, ReconcileErr>
where
    S: Store,
    K: StoreObject,
    F: FnOnce() -> Result<K, SynthesisError>,
{
    if store.get::<K>(namespace, name).await?.is_some() {
        debug!(kind = %K::kind(&()), %namespace, %name, "apply: present");
        return Ok(Applied::Unchanged);
    }
    let body = synthesize().map_err(synthesis_err::<K>)?;
    store.create(namespace, &body).await?;
    info!(kind = %K::kind(&()), %namespace, %name, "apply: created");
    Ok(Applied::Created)
}

/// Keep the existence of `name` in step with `enabled`, creating or
/// deleting as needed.
pub async fn ensure_toggled<S, K, F>(
    store: &S,
    namespace: &str,
    name: &str,
    enabled: bool,
    synthesize: F,
) -> Result<Applied, ReconcileErr>
where
    S: Store,
    K: StoreObject,
    F: FnOnce() -> Result<K, SynthesisError>,
{
    if enabled {
        return ensure_exists(store, namespace, name, synthesize).await;
    }
    if store.get::<K>(namespace, name).await?.is_none() {
        return Ok(Applied::Absent);
    }
    match store.delete::<K>(namespace, name).await {
        Ok(()) => {
            info!(kind = %K::kind(&()), %namespace, %name, "apply: deleted");
            Ok(Applied::Deleted)
        }
        // Gone between the read and the delete
        Err(e) if e.is_not_found() => Ok(Applied::Absent),
        Err(e) => Err(e.into()),
    }
}
