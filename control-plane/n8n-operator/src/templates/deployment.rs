use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use super::{
    CONTAINER_PORT, HTTP_PORT_NAME, RenderContext, SynthesisError, volume_claim_name,
};
use crate::crd::n8n::N8nSpec;

const USER_ID: i64 = 1000;
const GROUP_ID: i64 = 1000;
const USER_FOLDER: &str = "/home/node";
const DATA_DIR: &str = "/home/node/.n8n";
const DATA_VOLUME: &str = "n8n-data";

pub fn deployment_for(ctx: &RenderContext<'_>) -> Result<Deployment, SynthesisError> {
    let name = ctx.name();
    let spec = &ctx.n8n.spec;
    let selector = ctx.selector_labels();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut init_containers = Vec::new();
    if spec.storage_enabled() {
        volumes.push(Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume_claim_name(&name),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        });
        // Fresh volumes are root-owned; hand the data dir to the node user.
        init_containers.push(Container {
            name: "init-permissions".to_string(),
            image: Some(ctx.init_image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("chown -R {USER_ID}:{GROUP_ID} {DATA_DIR}"),
            ]),
            security_context: Some(SecurityContext {
                run_as_user: Some(0),
                run_as_non_root: Some(false),
                ..Default::default()
            }),
            volume_mounts: Some(mounts.clone()),
            ..Default::default()
        });
    }

    let container = Container {
        name: "n8n".to_string(),
        image: Some(ctx.n8n_image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "tini".to_string(),
            "--".to_string(),
            "/docker-entrypoint.sh".to_string(),
        ]),
        env: Some(n8n_env(spec)),
        ports: Some(vec![ContainerPort {
            container_port: CONTAINER_PORT,
            name: Some(HTTP_PORT_NAME.to_string()),
            ..Default::default()
        }]),
        security_context: Some(container_security_context()),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ctx.child_meta(name)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context: Some(pod_security_context()),
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Container environment. Only the sections present in the spec contribute
/// entries, so the size of the result varies with the record.
pub fn n8n_env(spec: &N8nSpec) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(db) = spec.database.as_ref() {
        let pg = &db.postgres;
        env.extend([
            var("DB_TYPE", "postgresdb"),
            var("DB_POSTGRESDB_HOST", &pg.host),
            var("DB_POSTGRESDB_PORT", &pg.port.to_string()),
            var("DB_POSTGRESDB_DATABASE", &pg.database),
            var("DB_POSTGRESDB_USER", &pg.user),
            var("DB_POSTGRESDB_PASSWORD", &pg.password),
            var("DB_POSTGRESDB_SSL_REJECT_UNAUTHORIZED", &(!pg.ssl).to_string()),
        ]);
    }
    env.push(var("N8N_USER_FOLDER", USER_FOLDER));
    if let Some(host) = spec.host() {
        let base_url = format!("https://{host}");
        env.extend([
            var("N8N_HOST", &base_url),
            var("N8N_EDITOR_BASE_URL", &base_url),
            var("N8N_TEMPLATES_ENABLED", "true"),
            var("WEBHOOK_URL", host),
        ]);
    }
    if let Some(metrics) = spec.metrics.as_ref() {
        env.push(var("N8N_METRICS", &metrics.enable.to_string()));
    }
    env
}

fn var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        fs_group: Some(GROUP_ID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(USER_ID),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
