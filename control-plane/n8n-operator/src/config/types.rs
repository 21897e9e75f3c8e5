use std::time::Duration;

use envconfig::Envconfig;

use crate::controller::Images;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Image for the n8n container.
    /// Env: N8N_IMAGE
    #[envconfig(from = "N8N_IMAGE", default = "ghcr.io/n8n-io/n8n:1.85.3")]
    pub n8n_image: String,

    /// Image for the init container that fixes data volume ownership.
    #[envconfig(from = "N8N_OPERATOR_INIT_IMAGE", default = "busybox")]
    pub init_image: String,

    /// Restrict watches to one namespace; all namespaces when unset or empty.
    #[envconfig(from = "N8N_OPERATOR_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    #[envconfig(from = "N8N_OPERATOR_ERROR_REQUEUE_SECS", default = "30")]
    pub error_requeue_secs: u64,

    /// Field manager and event reporter name.
    #[envconfig(from = "N8N_OPERATOR_REPORTER", default = "n8n-operator")]
    pub reporter: String,
}

impl OperatorConfig {
    pub fn watch_namespace(&self) -> Option<&str> {
        self.watch_namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn images(&self) -> Images {
        Images {
            n8n: self.n8n_image.clone(),
            init: self.init_image.clone(),
        }
    }
}
