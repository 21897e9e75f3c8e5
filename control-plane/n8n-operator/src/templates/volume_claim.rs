use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};

use super::{RenderContext, SynthesisError, parse_quantity};

pub fn volume_claim_name(owner: &str) -> String {
    format!("{owner}-data")
}

/// Claim for the n8n data directory. The size is read only here, at
/// creation; later edits to it are not applied to an existing claim.
pub fn volume_claim_for(
    ctx: &RenderContext<'_>,
) -> Result<PersistentVolumeClaim, SynthesisError> {
    let storage = ctx.n8n.spec.persistent_storage.clone().unwrap_or_default();
    let size = parse_quantity(&storage.size)?;

    Ok(PersistentVolumeClaim {
        metadata: ctx.child_meta(volume_claim_name(&ctx.name()))?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
            storage_class_name: storage.storage_class_name.filter(|s| !s.is_empty()),
            ..Default::default()
        }),
        ..Default::default()
    })
}
