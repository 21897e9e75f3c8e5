use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of one n8n installation.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cache.slys.dev",
    version = "v1alpha1",
    kind = "N8n",
    plural = "n8ns",
    namespaced,
    status = "N8nStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct N8nSpec {
    /// Database connection; omitted means n8n falls back to its embedded store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<Database>,
    /// Ingress exposure (mutually exclusive with `httpRoute`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,
    /// Gateway API exposure (mutually exclusive with `ingress`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_route: Option<HttpRouteConfig>,
    /// PersistentVolumeClaim backing the n8n data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<PersistentStorageConfig>,
    /// ServiceMonitor for Prometheus Operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
    /// Externally visible hostname shared by ingress and route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<HostnameConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct Database {
    pub postgres: Postgres,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct Postgres {
    pub host: String,
    pub port: u32,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteConfig {
    pub enable: bool,
    /// Required when `enable` is true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ref: Option<GatewayRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct GatewayRef {
    pub name: String,
    /// Defaults to the namespace of the N8n record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStorageConfig {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Quantity string such as "10Gi"; only read when the claim is created
    #[serde(default = "default_storage_size")]
    pub size: String,
}

impl Default for PersistentStorageConfig {
    fn default() -> Self {
        Self {
            enable: false,
            storage_class_name: None,
            size: default_storage_size(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MetricsConfig {
    pub enable: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct HostnameConfig {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct N8nStatus {
    /// Keyed by condition type; at most one entry per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

/// Condition key. Types written by other controllers keep their text so a
/// status write never merges or renames them.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    Available,
    Degraded,
    Other(String),
}

impl ConditionType {
    pub fn as_str(&self) -> &str {
        match self {
            ConditionType::Available => "Available",
            ConditionType::Degraded => "Degraded",
            ConditionType::Other(other) => other,
        }
    }
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Available" => ConditionType::Available,
            "Degraded" => ConditionType::Degraded,
            _ => ConditionType::Other(value),
        }
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

fn default_storage_size() -> String {
    "10Gi".into()
}

impl N8nSpec {
    pub fn ingress_enabled(&self) -> bool {
        self.ingress.as_ref().is_some_and(|i| i.enable)
    }

    pub fn http_route_enabled(&self) -> bool {
        self.http_route.as_ref().is_some_and(|r| r.enable)
    }

    pub fn storage_enabled(&self) -> bool {
        self.persistent_storage.as_ref().is_some_and(|p| p.enable)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.as_ref().is_some_and(|m| m.enable)
    }

    /// Hostname when the section is enabled and carries a non-empty url.
    pub fn host(&self) -> Option<&str> {
        self.hostname
            .as_ref()
            .filter(|h| h.enable)
            .and_then(|h| h.url.as_deref())
            .filter(|u| !u.is_empty())
    }
}

impl N8n {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }
}
