use super::{HTTP_PORT_NAME, RenderContext, SynthesisError};
use crate::crd::monitoring::{Endpoint, Selector, ServiceMonitor, ServiceMonitorSpec};

pub fn service_monitor_for(ctx: &RenderContext<'_>) -> Result<ServiceMonitor, SynthesisError> {
    let name = ctx.name();
    let mut monitor = ServiceMonitor::new(
        &name,
        ServiceMonitorSpec {
            endpoints: vec![Endpoint {
                port: Some(HTTP_PORT_NAME.to_string()),
                path: Some("/metrics".to_string()),
            }],
            selector: Selector {
                match_labels: ctx.selector_labels(),
            },
        },
    );
    monitor.metadata = ctx.child_meta(name)?;
    Ok(monitor)
}
