//! Pure builders that turn an [`N8n`] record into its child resources.
//!
//! Every builder attaches a controller owner reference so the API server's
//! garbage collector removes the children together with the record.

pub mod deployment;
pub mod http_route;
pub mod ingress;
pub mod quantity;
pub mod service;
pub mod service_monitor;
pub mod volume_claim;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::n8n::N8n;

pub use deployment::{deployment_for, n8n_env};
pub use http_route::http_route_for;
pub use ingress::ingress_for;
pub use quantity::parse_quantity;
pub use service::service_for;
pub use service_monitor::service_monitor_for;
pub use volume_claim::{volume_claim_for, volume_claim_name};

pub const MANAGED_BY: &str = "n8n-operator";
pub const HTTP_PORT_NAME: &str = "http";
pub const CONTAINER_PORT: i32 = 5678;
pub const SERVICE_PORT: i32 = 80;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),
    #[error("owner {0} has no uid yet")]
    MissingOwnerUid(String),
    #[error("ingress and httpRoute cannot both be enabled")]
    ExposureConflict,
    #[error("httpRoute is enabled but gatewayRef is missing")]
    MissingGatewayRef,
}

/// Inputs shared by every builder.
#[derive(Clone, Copy, Debug)]
pub struct RenderContext<'a> {
    pub n8n: &'a N8n,
    pub n8n_image: &'a str,
    pub init_image: &'a str,
}

impl<'a> RenderContext<'a> {
    pub fn new(n8n: &'a N8n, n8n_image: &'a str, init_image: &'a str) -> Self {
        Self {
            n8n,
            n8n_image,
            init_image,
        }
    }

    pub fn name(&self) -> String {
        self.n8n.name_any()
    }

    pub fn namespace(&self) -> String {
        self.n8n.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn owner_ref(&self) -> Result<OwnerReference, SynthesisError> {
        self.n8n
            .controller_owner_ref(&())
            .ok_or_else(|| SynthesisError::MissingOwnerUid(self.name()))
    }

    /// Labels used to select the installation's pods. Selectors are
    /// immutable, so the version label stays out of this set.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "n8n".to_string()),
            ("app.kubernetes.io/instance".to_string(), self.name()),
        ])
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            image_tag(self.n8n_image).to_string(),
        );
        labels
    }

    /// Metadata for a child named `name` in the record's namespace.
    pub fn child_meta(&self, name: String) -> Result<ObjectMeta, SynthesisError> {
        Ok(ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace()),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.owner_ref()?]),
            ..Default::default()
        })
    }
}

/// Tag portion of an image reference, `latest` when none is given.
pub fn image_tag(image: &str) -> &str {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let without_digest = last_segment.split('@').next().unwrap_or(last_segment);
    without_digest
        .split_once(':')
        .map(|(_, tag)| tag)
        .unwrap_or("latest")
}
