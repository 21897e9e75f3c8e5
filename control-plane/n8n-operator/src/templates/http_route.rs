use super::{RenderContext, SERVICE_PORT, SynthesisError};
use crate::crd::gateway::{
    HttpBackendRef, HttpPathMatch, HttpRoute, HttpRouteMatch, HttpRouteRule, HttpRouteSpec,
    ParentReference,
};

pub fn http_route_for(ctx: &RenderContext<'_>) -> Result<HttpRoute, SynthesisError> {
    let spec = &ctx.n8n.spec;
    if spec.ingress_enabled() {
        return Err(SynthesisError::ExposureConflict);
    }
    let gateway = spec
        .http_route
        .as_ref()
        .and_then(|r| r.gateway_ref.as_ref())
        .ok_or(SynthesisError::MissingGatewayRef)?;
    let name = ctx.name();

    let route_spec = HttpRouteSpec {
        parent_refs: vec![ParentReference {
            name: gateway.name.clone(),
            namespace: Some(gateway.namespace.clone().unwrap_or_else(|| ctx.namespace())),
        }],
        hostnames: spec.host().map(str::to_string).into_iter().collect(),
        rules: vec![HttpRouteRule {
            matches: vec![HttpRouteMatch {
                path: Some(HttpPathMatch {
                    type_: Some("PathPrefix".to_string()),
                    value: Some("/".to_string()),
                }),
            }],
            backend_refs: vec![HttpBackendRef {
                name: name.clone(),
                kind: Some("Service".to_string()),
                port: Some(SERVICE_PORT),
            }],
        }],
    };
    let mut route = HttpRoute::new(&name, route_spec);
    route.metadata = ctx.child_meta(name)?;
    Ok(route)
}
