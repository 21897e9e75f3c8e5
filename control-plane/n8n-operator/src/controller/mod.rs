pub mod apply;
pub mod conditions;
pub mod events;
pub mod finalizer;
pub mod reconcile;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{PersistentVolumeClaim, Service},
    networking::v1::Ingress,
};
use kube::{
    Client, Resource, ResourceExt,
    api::Api,
    runtime::{Controller, controller::Action, watcher::Config},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::n8n::N8n;
use crate::store::{KubeStore, StoreError};
use crate::templates::SynthesisError;

pub use events::{EventSink, KubeEvents, Notice, NoticeType, RecordingEvents};
pub use reconcile::reconcile_n8n;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot build {kind}: {source}")]
    Synthesis {
        kind: String,
        #[source]
        source: SynthesisError,
    },
    #[error("reconcile cancelled")]
    Cancelled,
    #[error("{source}; recording the failure also failed: {status}")]
    StatusUpdate {
        #[source]
        source: Box<ReconcileErr>,
        status: Box<ReconcileErr>,
    },
}

impl ReconcileErr {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileErr::Cancelled)
    }
}

/// Container images the synthesized workloads run.
#[derive(Clone, Debug)]
pub struct Images {
    pub n8n: String,
    pub init: String,
}

/// Capabilities one reconcile invocation needs, independent of how it was
/// triggered.
pub struct ReconcileContext<S> {
    pub store: Arc<S>,
    pub events: Arc<dyn EventSink>,
    pub images: Images,
}

impl<S> Clone for ReconcileContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
            images: self.images.clone(),
        }
    }
}

pub struct ControllerContext {
    pub reconciler: ReconcileContext<KubeStore>,
    pub shutdown: CancellationToken,
    pub error_requeue: Duration,
}

/// Race `fut` against `cancel`. A cancelled invocation drops whatever call
/// was in flight and reports [`ReconcileErr::Cancelled`].
pub async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, ReconcileErr>
where
    F: Future<Output = Result<T, E>>,
    ReconcileErr: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileErr::Cancelled),
        res = fut => res.map_err(ReconcileErr::from),
    }
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

pub async fn run_controller(
    client: Client,
    cfg: OperatorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ns = cfg.watch_namespace();
    let ctx = Arc::new(ControllerContext {
        reconciler: ReconcileContext {
            store: Arc::new(KubeStore::new(client.clone(), cfg.reporter.clone())),
            events: Arc::new(KubeEvents::new(client.clone(), &cfg.reporter)),
            images: cfg.images(),
        },
        shutdown,
        error_requeue: cfg.error_requeue(),
    });
    info!(namespace = ns.unwrap_or("<all>"), "starting n8n controller");

    Controller::new(scoped_api::<N8n>(client.clone(), ns), Config::default())
        .owns(scoped_api::<Deployment>(client.clone(), ns), Config::default())
        .owns(scoped_api::<Service>(client.clone(), ns), Config::default())
        .owns(
            scoped_api::<PersistentVolumeClaim>(client.clone(), ns),
            Config::default(),
        )
        .owns(scoped_api::<Ingress>(client, ns), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(name = %obj_ref.name, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    info!("n8n controller stopped");
    Ok(())
}

async fn reconcile(obj: Arc<N8n>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let cancel = ctx.shutdown.child_token();
    reconcile_n8n(&ctx.reconciler, &ns, &name, &cancel).await
}

fn error_policy(obj: Arc<N8n>, err: &ReconcileErr, ctx: Arc<ControllerContext>) -> Action {
    if err.is_cancelled() {
        return Action::await_change();
    }
    warn!(name = %obj.name_any(), error = %err, "reconcile failed; requeueing");
    Action::requeue(ctx.error_requeue)
}
