use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};

use super::{RenderContext, SERVICE_PORT, SynthesisError};

pub fn ingress_for(ctx: &RenderContext<'_>) -> Result<Ingress, SynthesisError> {
    let spec = &ctx.n8n.spec;
    if spec.http_route_enabled() {
        return Err(SynthesisError::ExposureConflict);
    }
    let config = spec.ingress.clone().unwrap_or_default();
    let name = ctx.name();

    let rule = IngressRule {
        host: spec.host().map(str::to_string),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: name.clone(),
                        port: Some(ServiceBackendPort {
                            number: Some(SERVICE_PORT),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    };
    let tls: Vec<IngressTLS> = config
        .tls
        .into_iter()
        .map(|t| IngressTLS {
            hosts: (!t.hosts.is_empty()).then_some(t.hosts),
            secret_name: t.secret_name,
        })
        .collect();

    Ok(Ingress {
        metadata: ctx.child_meta(name)?,
        spec: Some(IngressSpec {
            ingress_class_name: config.ingress_class_name,
            rules: Some(vec![rule]),
            tls: (!tls.is_empty()).then_some(tls),
            ..Default::default()
        }),
        ..Default::default()
    })
}
