use std::future::Future;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{PersistentVolumeClaim, Service},
    networking::v1::Ingress,
};
use kube::{Resource, ResourceExt, runtime::controller::Action};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::apply::{self, Applied};
use super::conditions::{self, REASON_FINALIZING, REASON_RECONCILING};
use super::events::{ACTION_FINALIZE, Notice, NoticeType, REASON_DELETING};
use super::finalizer;
use super::{ReconcileContext, ReconcileErr, cancellable};
use crate::crd::gateway::HttpRoute;
use crate::crd::monitoring::ServiceMonitor;
use crate::crd::n8n::{ConditionStatus, ConditionType, N8n};
use crate::store::{Store, StoreObject};
use crate::templates::{
    RenderContext, deployment_for, http_route_for, ingress_for, service_for,
    service_monitor_for, volume_claim_for, volume_claim_name,
};

/// A child step that failed, tagged with the kind it was working on.
struct Failure {
    kind: String,
    err: ReconcileErr,
}

/// Drive one record through its lifecycle: initialize status, attach the
/// finalizer, then either finalize a deleting record or ensure its children.
///
/// Every store call races `cancel`. A cancelled pass stops where it is and
/// leaves the last persisted status in place.
#[instrument(skip_all, fields(ns = %namespace, name = %name))]
pub async fn reconcile_n8n<S: Store>(
    ctx: &ReconcileContext<S>,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<Action, ReconcileErr> {
    let store = ctx.store.as_ref();
    let Some(mut n8n) = cancellable(cancel, store.get::<N8n>(namespace, name)).await? else {
        debug!(%namespace, %name, "reconcile: record not found; nothing to do");
        return Ok(Action::await_change());
    };

    if n8n.conditions().is_empty() {
        cancellable(
            cancel,
            conditions::record(
                store,
                namespace,
                &mut n8n,
                ConditionType::Available,
                ConditionStatus::Unknown,
                REASON_RECONCILING,
                "Starting reconciliation",
            ),
        )
        .await?;
        match cancellable(cancel, store.get::<N8n>(namespace, name)).await? {
            Some(fresh) => n8n = fresh,
            None => return Ok(Action::await_change()),
        }
    }

    if n8n.meta().deletion_timestamp.is_some() {
        return finalize(ctx, namespace, n8n, cancel).await;
    }

    cancellable(cancel, finalizer::ensure(store, namespace, &mut n8n)).await?;

    if let Err(failure) = ensure_children(ctx, namespace, &n8n, cancel).await {
        return Err(report_failure(ctx, namespace, &mut n8n, failure, cancel).await);
    }

    let message = format!("Resources for custom resource ({name}) reconciled successfully");
    cancellable(
        cancel,
        conditions::record(
            store,
            namespace,
            &mut n8n,
            ConditionType::Available,
            ConditionStatus::True,
            REASON_RECONCILING,
            &message,
        ),
    )
    .await?;
    debug!(%namespace, %name, "reconcile: children in place");
    Ok(Action::await_change())
}

async fn finalize<S: Store>(
    ctx: &ReconcileContext<S>,
    namespace: &str,
    mut n8n: N8n,
    cancel: &CancellationToken,
) -> Result<Action, ReconcileErr> {
    let store = ctx.store.as_ref();
    let name = n8n.name_any();
    if !finalizer::has_finalizer(&n8n) {
        debug!(%namespace, %name, "reconcile: deleting without finalizer; nothing to do");
        return Ok(Action::await_change());
    }
    info!(%namespace, %name, "reconcile: deletion timestamp detected; finalizing");

    cancellable(
        cancel,
        conditions::record(
            store,
            namespace,
            &mut n8n,
            ConditionType::Degraded,
            ConditionStatus::Unknown,
            REASON_FINALIZING,
            &format!("Performing finalizer operations for the custom resource: {name}"),
        ),
    )
    .await?;

    // Children go away with the record through their owner references
    let reference = n8n.object_ref(&());
    let notice = Notice {
        type_: NoticeType::Warning,
        reason: REASON_DELETING.to_string(),
        note: Some(format!(
            "Custom Resource {name} is being deleted from the namespace {namespace}"
        )),
        action: ACTION_FINALIZE.to_string(),
    };
    cancellable(cancel, async {
        ctx.events.publish(&reference, notice).await;
        Ok::<_, ReconcileErr>(())
    })
    .await?;

    cancellable(
        cancel,
        conditions::record(
            store,
            namespace,
            &mut n8n,
            ConditionType::Degraded,
            ConditionStatus::True,
            REASON_FINALIZING,
            &format!("Finalizer operations for custom resource {name} were successfully accomplished"),
        ),
    )
    .await?;

    cancellable(cancel, finalizer::release(store, namespace, &mut n8n)).await?;
    info!(%namespace, %name, "reconcile: finalized");
    Ok(Action::await_change())
}

async fn step<K, F>(cancel: &CancellationToken, fut: F) -> Result<Applied, Failure>
where
    K: StoreObject,
    F: Future<Output = Result<Applied, ReconcileErr>>,
{
    cancellable(cancel, fut).await.map_err(|err| Failure {
        kind: K::kind(&()).to_string(),
        err,
    })
}

/// Children in dependency order. The claim comes first so the Deployment
/// never mounts a volume that was never requested.
async fn ensure_children<S: Store>(
    ctx: &ReconcileContext<S>,
    namespace: &str,
    n8n: &N8n,
    cancel: &CancellationToken,
) -> Result<(), Failure> {
    let store = ctx.store.as_ref();
    let render = RenderContext::new(n8n, &ctx.images.n8n, &ctx.images.init);
    let name = render.name();
    let spec = &n8n.spec;

    if spec.storage_enabled() {
        let claim = volume_claim_name(&name);
        step::<PersistentVolumeClaim, _>(
            cancel,
            apply::ensure_exists(store, namespace, &claim, || volume_claim_for(&render)),
        )
        .await?;
    }
    step::<Deployment, _>(
        cancel,
        apply::ensure_exists(store, namespace, &name, || deployment_for(&render)),
    )
    .await?;
    step::<Service, _>(
        cancel,
        apply::ensure_exists(store, namespace, &name, || service_for(&render)),
    )
    .await?;
    if spec.ingress_enabled() {
        step::<Ingress, _>(
            cancel,
            apply::ensure_exists(store, namespace, &name, || ingress_for(&render)),
        )
        .await?;
    }
    if spec.http_route_enabled() {
        step::<HttpRoute, _>(
            cancel,
            apply::ensure_exists(store, namespace, &name, || http_route_for(&render)),
        )
        .await?;
    }
    step::<ServiceMonitor, _>(
        cancel,
        apply::ensure_toggled(store, namespace, &name, spec.metrics_enabled(), || {
            service_monitor_for(&render)
        }),
    )
    .await?;
    Ok(())
}

/// Record `Available=False` for a failed pass and hand back the error to
/// return. A failed status write is reported together with the original.
async fn report_failure<S: Store>(
    ctx: &ReconcileContext<S>,
    namespace: &str,
    n8n: &mut N8n,
    failure: Failure,
    cancel: &CancellationToken,
) -> ReconcileErr {
    let Failure { kind, err } = failure;
    if err.is_cancelled() {
        return err;
    }
    let name = n8n.name_any();
    error!(%namespace, %name, %kind, error = %err, "reconcile: failed to manage child resource");
    let message = format!("Failed to manage {kind} for the custom resource ({name}): {err}");
    let recorded = cancellable(
        cancel,
        conditions::record(
            ctx.store.as_ref(),
            namespace,
            n8n,
            ConditionType::Available,
            ConditionStatus::False,
            REASON_RECONCILING,
            &message,
        ),
    )
    .await;
    match recorded {
        Ok(_) => err,
        Err(status) if status.is_cancelled() => status,
        Err(status) => ReconcileErr::StatusUpdate {
            source: Box::new(err),
            status: Box::new(status),
        },
    }
}
